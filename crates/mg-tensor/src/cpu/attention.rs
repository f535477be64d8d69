use crate::backend::{AttentionDims, MASKED_SCORE};

use super::softmax_into;

/// Attention for one (batch, head) pair, flattened as `b * num_heads + h`.
///
/// Returns `[query_len, head_dim]` for that pair.
pub(super) fn attend_head(
    query: &[f32],
    key: &[f32],
    value: &[f32],
    mask: &[bool],
    dims: &AttentionDims,
    pair: usize,
) -> Vec<f32> {
    let b = pair / dims.num_heads;
    let h = pair % dims.num_heads;
    let d = dims.head_dim;
    let row = dims.num_heads * d;
    let scale = 1.0 / (d as f32).sqrt();

    let mut scores = vec![0.0f32; dims.key_len];
    let mut probs = vec![0.0f32; dims.key_len];
    let mut out = vec![0.0f32; dims.query_len * d];

    for qi in 0..dims.query_len {
        let q_off = (b * dims.query_len + qi) * row + h * d;
        let q_head = &query[q_off..q_off + d];
        let mask_row = &mask[(b * dims.query_len + qi) * dims.key_len..][..dims.key_len];

        for (kj, score) in scores.iter_mut().enumerate() {
            if !mask_row[kj] {
                *score = MASKED_SCORE;
                continue;
            }
            let k_off = (b * dims.key_len + kj) * row + h * d;
            let dot: f32 = q_head
                .iter()
                .zip(&key[k_off..k_off + d])
                .map(|(x, y)| x * y)
                .sum();
            *score = dot * scale;
        }

        softmax_into(&scores, &mut probs);

        let out_row = &mut out[qi * d..(qi + 1) * d];
        for (kj, &p) in probs.iter().enumerate() {
            // Exactly zero for masked keys whenever one key is visible.
            if p == 0.0 {
                continue;
            }
            let v_off = (b * dims.key_len + kj) * row + h * d;
            for (o, v) in out_row.iter_mut().zip(&value[v_off..v_off + d]) {
                *o += p * v;
            }
        }
    }
    out
}

/// Scatters per-(batch, head) outputs back into `[batch, query_len, heads, head_dim]`.
pub(super) fn interleave_heads(head_outputs: &[Vec<f32>], dims: &AttentionDims) -> Vec<f32> {
    let d = dims.head_dim;
    let mut out = vec![0.0f32; dims.query_numel()];
    for (pair, head) in head_outputs.iter().enumerate() {
        let b = pair / dims.num_heads;
        let h = pair % dims.num_heads;
        for qi in 0..dims.query_len {
            let dst = ((b * dims.query_len + qi) * dims.num_heads + h) * d;
            out[dst..dst + d].copy_from_slice(&head[qi * d..(qi + 1) * d]);
        }
    }
    out
}
