//! Prompt formats used to turn an [`InstructionExample`] into training text.
//!
//! | name | Layout |
//! |------|--------|
//! | `alpaca` | `### Instruction:` / `### Input:` / `### Response:` |
//! | `chatml` / `qwen2` | `<\|im_start\|>` / `<\|im_end\|>` |
//! | `llama3` | `<\|start_header_id\|>` / `<\|eot_id\|>` |
//! | `llama2` / `llama` | `<s>[INST] … [/INST]` |
//!
//! Every format is split into a prompt half and a response half so the
//! collator can mask the prompt out of the loss.

use anyhow::{bail, Result};

use crate::dataset::InstructionExample;

const ALPACA_PREAMBLE: &str = "Below is an instruction that describes a task. \
    Write a response that appropriately completes the request.";
const ALPACA_PREAMBLE_WITH_INPUT: &str = "Below is an instruction that describes a task, \
    paired with an input that provides further context. \
    Write a response that appropriately completes the request.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    #[default]
    Alpaca,
    ChatMl,
    Llama3,
    Llama2,
}

impl PromptTemplate {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "alpaca" => Self::Alpaca,
            "chatml" | "qwen2" => Self::ChatMl,
            "llama3" => Self::Llama3,
            "llama2" | "llama" => Self::Llama2,
            other => bail!(
                "Unknown prompt template '{other}'. Valid values: alpaca, chatml, qwen2, llama3, llama2."
            ),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Alpaca => "alpaca",
            Self::ChatMl => "chatml",
            Self::Llama3 => "llama3",
            Self::Llama2 => "llama2",
        }
    }

    /// Whether the rendered prompt already starts with the BOS marker.
    pub fn emits_bos(&self) -> bool {
        matches!(self, Self::Llama3 | Self::Llama2)
    }

    /// Everything the model sees before it should start answering.
    ///
    /// A non-empty `system` replaces the Alpaca preamble and becomes the
    /// system turn in chat formats.
    pub fn render_prompt(&self, ex: &InstructionExample, system: &str) -> String {
        let user = user_message(ex);
        match self {
            Self::Alpaca => {
                let preamble = match (system.is_empty(), ex.input.is_empty()) {
                    (false, _) => system,
                    (true, true) => ALPACA_PREAMBLE,
                    (true, false) => ALPACA_PREAMBLE_WITH_INPUT,
                };
                let mut s = format!("{preamble}\n\n### Instruction:\n{}\n\n", ex.instruction);
                if !ex.input.is_empty() {
                    s.push_str(&format!("### Input:\n{}\n\n", ex.input));
                }
                s.push_str("### Response:\n");
                s
            }
            Self::ChatMl => {
                let mut s = String::new();
                if !system.is_empty() {
                    s.push_str(&format!("<|im_start|>system\n{system}<|im_end|>\n"));
                }
                s.push_str(&format!("<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n"));
                s
            }
            Self::Llama3 => {
                let mut s = String::from("<|begin_of_text|>");
                if !system.is_empty() {
                    s.push_str(&format!(
                        "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>"
                    ));
                }
                s.push_str(&format!(
                    "<|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
                     <|start_header_id|>assistant<|end_header_id|>\n\n"
                ));
                s
            }
            Self::Llama2 => {
                if system.is_empty() {
                    format!("<s>[INST] {user} [/INST]")
                } else {
                    format!("<s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user} [/INST]")
                }
            }
        }
    }

    /// The supervised target: the output plus the format's end-of-turn
    /// marker. EOS itself is appended by the collator.
    pub fn render_response(&self, output: &str) -> String {
        match self {
            Self::Alpaca => output.to_string(),
            Self::ChatMl => format!("{output}<|im_end|>"),
            Self::Llama3 => format!("{output}<|eot_id|>"),
            Self::Llama2 => format!(" {output}"),
        }
    }
}

/// Chat formats have no input slot; the input follows the instruction.
fn user_message(ex: &InstructionExample) -> String {
    if ex.input.is_empty() {
        ex.instruction.clone()
    } else {
        format!("{}\n\n{}", ex.instruction, ex.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(instruction: &str, input: &str, output: &str) -> InstructionExample {
        InstructionExample {
            instruction: instruction.into(),
            input: input.into(),
            output: output.into(),
        }
    }

    #[test]
    fn alpaca_without_input_omits_section() {
        let out = PromptTemplate::Alpaca.render_prompt(&ex("Say hi", "", "hi"), "");
        assert!(out.starts_with(ALPACA_PREAMBLE));
        assert!(out.contains("### Instruction:\nSay hi\n\n"));
        assert!(!out.contains("### Input:"));
        assert!(out.ends_with("### Response:\n"));
    }

    #[test]
    fn alpaca_with_input() {
        let out = PromptTemplate::Alpaca.render_prompt(&ex("Add", "2 and 2", "4"), "");
        assert!(out.starts_with(ALPACA_PREAMBLE_WITH_INPUT));
        assert!(out.contains("### Input:\n2 and 2\n\n### Response:\n"));
    }

    #[test]
    fn alpaca_system_replaces_preamble() {
        let out = PromptTemplate::Alpaca.render_prompt(&ex("a", "", "b"), "You are terse.");
        assert!(out.starts_with("You are terse.\n\n### Instruction:"));
    }

    #[test]
    fn chatml_layout() {
        let t = PromptTemplate::parse("qwen2").unwrap();
        assert_eq!(t, PromptTemplate::ChatMl);
        let out = t.render_prompt(&ex("hello", "", "x"), "sys");
        assert!(out.starts_with("<|im_start|>system\nsys<|im_end|>\n"));
        assert!(out.ends_with("<|im_start|>user\nhello<|im_end|>\n<|im_start|>assistant\n"));
        assert_eq!(t.render_response("x"), "x<|im_end|>");
        assert!(!t.emits_bos());
    }

    #[test]
    fn llama3_layout() {
        let t = PromptTemplate::Llama3;
        let out = t.render_prompt(&ex("q", "ctx", "a"), "");
        assert!(out.starts_with("<|begin_of_text|><|start_header_id|>user"));
        assert!(out.contains("q\n\nctx<|eot_id|>"));
        assert!(out.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert!(t.emits_bos());
    }

    #[test]
    fn llama2_layout() {
        let t = PromptTemplate::parse("llama").unwrap();
        assert_eq!(t.render_prompt(&ex("hello", "", "x"), ""), "<s>[INST] hello [/INST]");
        assert!(t.render_prompt(&ex("hello", "", "x"), "sys").contains("<<SYS>>\nsys\n<</SYS>>"));
        assert_eq!(t.render_response("x"), " x");
    }

    #[test]
    fn unknown_template_errors() {
        assert!(PromptTemplate::parse("vicuna").is_err());
        assert_eq!(PromptTemplate::default().name(), "alpaca");
    }
}
