//! Embedding math shared by clustering and re-homing.
//!
//! All accumulation happens in f64 so results do not depend on the
//! order vectors are visited in.

/// Cosine similarity between two vectors.
/// Returns 0 if either vector has zero norm.
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let ai = x as f64;
        let bi = y as f64;
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Dot product of two vectors that are already unit length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        sum += (x as f64) * (y as f64);
    }
    sum as f32
}

/// Normalizes a vector to unit length in-place.
/// A zero vector is left as is.
pub fn l2_norm(v: &mut [f32]) {
    let mut sum: f64 = 0.0;
    for &x in v.iter() {
        sum += (x as f64) * (x as f64);
    }
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Returns a unit-length copy of `v`.
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_norm(&mut out);
    out
}

/// Mean of the given vectors, renormalized to unit length.
///
/// Returns `None` when `vectors` is empty.
pub fn centroid<'a, I>(vectors: I, dim: usize) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum = vec![0.0f64; dim];
    let mut count = 0usize;
    for v in vectors {
        for (acc, &x) in sum.iter_mut().zip(v) {
            *acc += x as f64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let n = count as f64;
    let mut mean: Vec<f32> = sum.into_iter().map(|x| (x / n) as f32).collect();
    l2_norm(&mut mean);
    Some(mean)
}
