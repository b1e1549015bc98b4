//! Tokenization and batching for supervised fine-tuning.
//!
//! An example is encoded as `[BOS] prompt response [EOS]`. Only response
//! tokens are supervised unless `train_on_prompt` is set. Batches are
//! right-padded and shifted for next-token prediction, so position `i` of
//! `labels` holds the token that follows position `i` of `input_ids`.

use anyhow::Result;
use candle_core::{Device, Tensor};

use lorafit_core::Tokenizer;

use crate::dataset::InstructionExample;
use crate::template::PromptTemplate;

/// One tokenized example, before shifting.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExample {
    pub tokens: Vec<u32>,
    /// `true` where the token is a training target.
    pub supervised: Vec<bool>,
}

/// A padded, shifted batch of host-side vectors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, seq_len]`
    pub input_ids: Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<Vec<u32>>,
    /// Next-token targets; padded positions hold the pad id.
    pub labels: Vec<Vec<u32>>,
    /// 1.0 where `labels` contributes to the loss.
    pub loss_mask: Vec<Vec<f32>>,
}

/// [`Batch`] on a device.
#[derive(Debug)]
pub struct BatchTensors {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
    pub loss_mask: Tensor,
}

/// Tokenize one example. Returns `None` when truncation leaves nothing to
/// supervise.
pub fn encode_example(
    tokenizer: &Tokenizer,
    template: PromptTemplate,
    example: &InstructionExample,
    system: &str,
    max_seq_len: usize,
    train_on_prompt: bool,
) -> Result<Option<EncodedExample>> {
    let mut prompt = Vec::new();
    if !template.emits_bos() {
        if let Some(bos) = tokenizer.bos_token_id() {
            prompt.push(bos);
        }
    }
    prompt.extend(tokenizer.encode(&template.render_prompt(example, system), false)?);

    let mut response = tokenizer.encode(&template.render_response(&example.output), false)?;
    if let Some(eos) = tokenizer.eos_token_id() {
        if response.last() != Some(&eos) {
            response.push(eos);
        }
    }

    let mut supervised = vec![train_on_prompt; prompt.len()];
    supervised.extend(std::iter::repeat(true).take(response.len()));
    let mut tokens = prompt;
    tokens.extend(response);

    tokens.truncate(max_seq_len);
    supervised.truncate(max_seq_len);

    // The first token is never a target: nothing precedes it.
    if tokens.len() < 2 || !supervised[1..].iter().any(|&s| s) {
        return Ok(None);
    }
    Ok(Some(EncodedExample { tokens, supervised }))
}

/// Shift, right-pad and stack a batch of encoded examples.
pub fn collate(batch: &[&EncodedExample], pad_id: u32) -> Batch {
    let max_len = batch
        .iter()
        .map(|e| e.tokens.len().saturating_sub(1))
        .max()
        .unwrap_or(0);

    let mut out = Batch {
        input_ids: Vec::with_capacity(batch.len()),
        attention_mask: Vec::with_capacity(batch.len()),
        labels: Vec::with_capacity(batch.len()),
        loss_mask: Vec::with_capacity(batch.len()),
    };

    for ex in batch {
        let n = ex.tokens.len().saturating_sub(1);
        let pad = max_len - n;

        let mut ids = ex.tokens[..n].to_vec();
        ids.extend(std::iter::repeat(pad_id).take(pad));

        let mut attn = vec![1u32; n];
        attn.extend(std::iter::repeat(0).take(pad));

        let mut labels = ex.tokens[1..].to_vec();
        labels.extend(std::iter::repeat(pad_id).take(pad));

        let mut mask: Vec<f32> = ex.supervised[1..]
            .iter()
            .map(|&s| if s { 1.0 } else { 0.0 })
            .collect();
        mask.extend(std::iter::repeat(0.0).take(pad));

        out.input_ids.push(ids);
        out.attention_mask.push(attn);
        out.labels.push(labels);
        out.loss_mask.push(mask);
    }
    out
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    /// Non-padding input tokens.
    pub fn num_tokens(&self) -> usize {
        self.attention_mask.iter().flatten().filter(|&&m| m == 1).count()
    }

    /// Tokens that contribute to the loss.
    pub fn num_targets(&self) -> usize {
        self.loss_mask.iter().flatten().filter(|&&m| m > 0.0).count()
    }

    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        Ok(BatchTensors {
            input_ids: tensor_2d(&self.input_ids, device)?,
            attention_mask: tensor_2d(&self.attention_mask, device)?,
            labels: tensor_2d(&self.labels, device)?,
            loss_mask: tensor_2d(&self.loss_mask, device)?,
        })
    }
}

fn tensor_2d<T: candle_core::WithDType>(rows: &[Vec<T>], device: &Device) -> Result<Tensor> {
    let b = rows.len();
    let t = rows.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<T> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (b, t), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::toy_tokenizer;

    fn example(output: &str) -> InstructionExample {
        InstructionExample {
            instruction: "what is two plus two".into(),
            input: String::new(),
            output: output.into(),
        }
    }

    #[test]
    fn encodes_bos_prompt_response_eos() {
        let tok = toy_tokenizer();
        let t = PromptTemplate::Alpaca;
        let ex = example("four");
        let enc = encode_example(&tok, t, &ex, "", 512, false).unwrap().unwrap();

        let prompt_len = 1 + tok.encode(&t.render_prompt(&ex, ""), false).unwrap().len();
        assert_eq!(enc.tokens[0], 1, "BOS first");
        assert_eq!(enc.tokens.len(), prompt_len + 2, "prompt + 'four' + EOS");
        assert_eq!(&enc.tokens[prompt_len..], &[12, 2]);
        assert!(enc.supervised[..prompt_len].iter().all(|&s| !s));
        assert!(enc.supervised[prompt_len..].iter().all(|&s| s));
    }

    #[test]
    fn train_on_prompt_supervises_everything() {
        let tok = toy_tokenizer();
        let enc = encode_example(&tok, PromptTemplate::Alpaca, &example("four"), "", 512, true)
            .unwrap()
            .unwrap();
        assert!(enc.supervised.iter().all(|&s| s));
    }

    #[test]
    fn truncation_dropping_response_skips_example() {
        let tok = toy_tokenizer();
        let enc = encode_example(&tok, PromptTemplate::Alpaca, &example("four"), "", 5, false).unwrap();
        assert!(enc.is_none());
    }

    #[test]
    fn collate_shifts_and_pads() {
        let a = EncodedExample { tokens: vec![1, 10, 11, 2], supervised: vec![false, false, true, true] };
        let b = EncodedExample { tokens: vec![1, 12, 2], supervised: vec![false, true, true] };
        let batch = collate(&[&a, &b], 0);

        assert_eq!(batch.input_ids, vec![vec![1, 10, 11], vec![1, 12, 0]]);
        assert_eq!(batch.labels, vec![vec![10, 11, 2], vec![12, 2, 0]]);
        assert_eq!(batch.attention_mask, vec![vec![1, 1, 1], vec![1, 1, 0]]);
        assert_eq!(batch.loss_mask, vec![vec![0.0, 1.0, 1.0], vec![1.0, 1.0, 0.0]]);
        assert_eq!(batch.num_tokens(), 5);
        assert_eq!(batch.num_targets(), 4);
    }

    #[test]
    fn to_tensors_shapes() {
        let a = EncodedExample { tokens: vec![1, 10, 2], supervised: vec![false, true, true] };
        let t = collate(&[&a, &a], 0).to_tensors(&Device::Cpu).unwrap();
        assert_eq!(t.input_ids.dims(), &[2, 2]);
        assert_eq!(t.loss_mask.dtype(), candle_core::DType::F32);
    }
}
