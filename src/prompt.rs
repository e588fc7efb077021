use serde::{Deserialize, Serialize};

pub const RESPONSE_MARKER: &str = "### Response:";

const ALPACA_WITH_INPUT: &str = "Below is an instruction that describes a task, paired with an input that provides further context. \
Write a response that appropriately completes the request.\n\n\
### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:";

const ALPACA_NO_INPUT: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.\n\n\
### Instruction:\n{instruction}\n\n### Response:";

const PLAIN: &str = "{instruction}\n\n### Response:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PromptTemplate {
    #[default]
    Default,
    Alpaca,
}

impl PromptTemplate {
    fn with_input(&self) -> &'static str {
        match self {
            PromptTemplate::Default => PLAIN,
            PromptTemplate::Alpaca => ALPACA_WITH_INPUT,
        }
    }

    fn without_input(&self) -> &'static str {
        match self {
            PromptTemplate::Default => PLAIN,
            PromptTemplate::Alpaca => ALPACA_NO_INPUT,
        }
    }
}

/// Builds prompts from instructions and pulls the model's answer back out of
/// the decoded output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prompter {
    template: PromptTemplate,
}

impl Prompter {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    pub fn generate_prompt(
        &self,
        instruction: &str,
        input: Option<&str>,
        response: Option<&str>,
    ) -> String {
        let mut prompt = match input {
            Some(input) => self
                .template
                .with_input()
                .replace("{instruction}", instruction)
                .replace("{input}", input),
            None => self.template.without_input().replace("{instruction}", instruction),
        };

        if let Some(response) = response.filter(|r| !r.is_empty()) {
            prompt.push_str(response);
        }
        prompt
    }

    /// Text between the first response marker and the next one (or the end),
    /// trimmed. Output without a marker is returned trimmed as a whole.
    pub fn get_response<'a>(&self, output: &'a str) -> &'a str {
        match output.split(RESPONSE_MARKER).nth(1) {
            Some(response) => response.trim(),
            None => output.trim(),
        }
    }
}
