//! Small, pure vector helpers.
//!
//! Everything here is total except where a zero norm makes the answer
//! undefined; those functions return `None` and the caller decides whether
//! that is fatal.

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

pub fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

pub fn sub(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

/// Element-wise binding of two symbolic vectors.
pub fn bind(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x * y).collect()
}

pub fn normalize_in_place(v: &mut [f32]) -> bool {
    let n = norm(v);
    if !(n > 0.0) || !n.is_finite() {
        return false;
    }
    let inv = 1.0f32 / n;
    for x in v.iter_mut() {
        *x *= inv;
    }
    true
}

/// Cosine similarity, `None` when either side has zero norm.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    let na = norm(a);
    let nb = norm(b);
    if !(na > 0.0) || !(nb > 0.0) {
        return None;
    }
    Some((dot(a, b) / (na * nb)).clamp(-1.0, 1.0))
}

/// Cosine distance `1 - cosine`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    cosine(a, b).map(|s| 1.0 - s)
}

/// Mean of the given vectors, normalized. `None` for an empty input or a
/// zero-norm mean.
pub fn centroid<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Vec<f32> = Vec::new();
    for v in vectors {
        if sum.is_empty() {
            sum = v.to_vec();
        } else {
            for (s, x) in sum.iter_mut().zip(v) {
                *s += x;
            }
        }
    }
    if sum.is_empty() || !normalize_in_place(&mut sum) {
        return None;
    }
    Some(sum)
}

pub fn is_finite(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cosine_of_parallel_and_orthogonal() {
        assert_relative_eq!(cosine(&[1.0, 0.0], &[2.0, 0.0]).unwrap(), 1.0);
        assert_relative_eq!(cosine(&[1.0, 0.0], &[0.0, 3.0]).unwrap(), 0.0);
        assert_relative_eq!(cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap(), 2.0);
    }

    #[test]
    fn zero_norm_is_undefined() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), None);
        let mut z = vec![0.0, 0.0];
        assert!(!normalize_in_place(&mut z));
    }

    #[test]
    fn centroid_is_normalized() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = centroid([&a[..], &b[..]]).unwrap();
        assert_relative_eq!(norm(&c), 1.0, epsilon = 1e-6);
        assert_relative_eq!(c[0], c[1]);
        assert!(centroid([&a[..], &[-1.0f32, 0.0][..]]).is_none());
    }

    #[test]
    fn bind_is_self_inverse_for_bipolar_roles() {
        let v = [0.5f32, -0.25, 1.0];
        let role = [1.0f32, -1.0, -1.0];
        assert_eq!(bind(&bind(&v, &role), &role), v.to_vec());
    }
}
