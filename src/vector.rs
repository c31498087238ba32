use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Angle-based, always in [-1, 1].
    #[default]
    Cosine,
    /// Raw inner product. Equals cosine for unit vectors, unbounded otherwise.
    Dot,
}

impl Metric {
    /// Similarity between two equal-length vectors. HIGHER is ALWAYS closer.
    ///
    /// Lanes are unrolled by 8 so LLVM can keep the three accumulators in
    /// vector registers; the remainder is handled scalar.
    #[inline(always)]
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Metric::Dot => dot(a, b),
            Metric::Cosine => {
                let mut dot = 0.0;
                let mut norm_a = 0.0;
                let mut norm_b = 0.0;

                let chunks = a.chunks_exact(8);
                let b_chunks = b.chunks_exact(8);
                let remainder_start = a.len() - a.len() % 8;

                for (ac, bc) in chunks.zip(b_chunks) {
                    dot += ac[0]*bc[0] + ac[1]*bc[1] + ac[2]*bc[2] + ac[3]*bc[3] +
                    ac[4]*bc[4] + ac[5]*bc[5] + ac[6]*bc[6] + ac[7]*bc[7];

                    norm_a += ac[0]*ac[0] + ac[1]*ac[1] + ac[2]*ac[2] + ac[3]*ac[3] +
                    ac[4]*ac[4] + ac[5]*ac[5] + ac[6]*ac[6] + ac[7]*ac[7];

                    norm_b += bc[0]*bc[0] + bc[1]*bc[1] + bc[2]*bc[2] + bc[3]*bc[3] +
                    bc[4]*bc[4] + bc[5]*bc[5] + bc[6]*bc[6] + bc[7]*bc[7];
                }

                for i in remainder_start..a.len() {
                    dot += a[i] * b[i];
                    norm_a += a[i] * a[i];
                    norm_b += b[i] * b[i];
                }

                // A zero vector has no direction: treat it as orthogonal to everything.
                if norm_a == 0.0 || norm_b == 0.0 { return 0.0; }
                (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::Dot => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::Dot),
            _ => None,
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "dot" | "inner" | "ip" => Ok(Metric::Dot),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

#[inline(always)]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    let remainder_start = a.len() - a.len() % 8;

    for (ac, bc) in a.chunks_exact(8).zip(b.chunks_exact(8)) {
        sum += ac[0]*bc[0] + ac[1]*bc[1] + ac[2]*bc[2] + ac[3]*bc[3] +
        ac[4]*bc[4] + ac[5]*bc[5] + ac[6]*bc[6] + ac[7]*bc[7];
    }
    for i in remainder_start..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Scales `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v: Vec<f32> = (0..19).map(|i| i as f32 * 0.5 - 3.0).collect();
        assert!(approx(Metric::Cosine.similarity(&v, &v), 1.0));
    }

    #[test]
    fn cosine_is_scale_invariant_and_bounded() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        let c = [-1.0, -2.0, -3.0];
        assert!(approx(Metric::Cosine.similarity(&a, &b), 1.0));
        assert!(approx(Metric::Cosine.similarity(&a, &c), -1.0));
        assert!(approx(Metric::Cosine.similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
    }

    #[test]
    fn zero_vector_scores_zero() {
        assert_eq!(Metric::Cosine.similarity(&[0.0; 4], &[1.0, 0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn dot_matches_cosine_for_unit_vectors() {
        let mut a: Vec<f32> = (1..=12).map(|i| i as f32).collect();
        let mut b: Vec<f32> = (1..=12).rev().map(|i| i as f32).collect();
        normalize(&mut a);
        normalize(&mut b);
        assert!(approx(Metric::Dot.similarity(&a, &b), Metric::Cosine.similarity(&a, &b)));
    }

    #[test]
    fn metric_codes_round_trip() {
        for m in [Metric::Cosine, Metric::Dot] {
            assert_eq!(Metric::from_code(m.code()), Some(m));
            assert_eq!(m.name().parse::<Metric>(), Ok(m));
        }
        assert_eq!(Metric::from_code(9), None);
    }
}
