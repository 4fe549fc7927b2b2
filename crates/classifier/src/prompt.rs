//! Classifier prompt composition
//!
//! Assembly order is fixed: instruction preamble, prompt-inclusion tool
//! list, keyword glossary, feedback few-shots, conversation tail, query.

use hearth_core::{ConversationMessage, Correction};
use hearth_tools::ToolDescriptor;

const PREAMBLE: &str = "\
You are the intent classifier of a household assistant. Classify the user's \
query into up to three candidate intents, best first. An intent label is \
either a tool name from the list below, `knowledge.ask` (the answer lives in \
the user's documents), or `general.conversation` (no tool; answer directly). \
Reply with a JSON array of objects: \
[{\"label\": \"...\", \"confidence\": 0.0-1.0, \"params\": {...}}]. \
No other text.";

/// Everything the prompt is assembled from
pub struct ClassifierPromptInputs<'a> {
    pub query: &'a str,
    pub tail: &'a [ConversationMessage],
    pub tools: &'a [ToolDescriptor],
    /// Device and friendly names from the smart-home integration
    pub glossary: Option<&'a str>,
    /// Per-server illustration: (example intent, sample queries)
    pub server_examples: &'a [(String, Vec<String>)],
    pub fewshots: &'a [Correction],
}

/// Build the full classifier prompt.
pub fn build_classifier_prompt(inputs: &ClassifierPromptInputs<'_>) -> String {
    let mut prompt = String::from(PREAMBLE);

    if !inputs.tools.is_empty() {
        prompt.push_str("\n\n## Tools\n");
        for tool in inputs.tools {
            prompt.push_str(&tool.prompt_line());
            prompt.push('\n');
        }
    }

    for (intent, queries) in inputs.server_examples {
        for query in queries {
            prompt.push_str(&format!("Example: {query:?} -> {intent}\n"));
        }
    }

    if let Some(glossary) = inputs.glossary {
        prompt.push_str("\n## Known device names\n");
        prompt.push_str(glossary);
        prompt.push('\n');
    }

    if !inputs.fewshots.is_empty() {
        prompt.push_str("\n## Corrections from past mistakes\n");
        for correction in inputs.fewshots {
            prompt.push_str(&format!(
                "Query {:?} is {}, not {}.\n",
                correction.query, correction.right_label, correction.wrong_label
            ));
        }
    }

    if !inputs.tail.is_empty() {
        prompt.push_str("\n## Conversation so far\n");
        for message in inputs.tail {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }
    }

    prompt.push_str("\n## Query\n");
    prompt.push_str(inputs.query);
    prompt
}
