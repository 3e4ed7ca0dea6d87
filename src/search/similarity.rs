/// Pluggable scoring model. The defaults are the classic tf-idf
/// vector-space formulas; override individual hooks to change weighting.
pub trait Similarity: Send + Sync {
    /// Term-frequency factor.
    fn tf(&self, freq: f32) -> f32 {
        freq.sqrt()
    }

    /// Inverse document frequency.
    fn idf(&self, doc_freq: u32, num_docs: u32) -> f32 {
        (num_docs as f32 / (doc_freq as f32 + 1.0)).ln() + 1.0
    }

    /// Reward for matching more clauses of a boolean query.
    fn coord(&self, overlap: u32, max_overlap: u32) -> f32 {
        if max_overlap == 0 {
            1.0
        } else {
            overlap as f32 / max_overlap as f32
        }
    }

    /// Shorter fields score higher.
    fn length_norm(&self, _field: &str, num_terms: u32) -> f32 {
        1.0 / (num_terms.max(1) as f32).sqrt()
    }

    /// Normalizes query weights so scores are comparable across queries.
    fn query_norm(&self, sum_of_squared_weights: f32) -> f32 {
        if sum_of_squared_weights <= 0.0 {
            1.0
        } else {
            1.0 / sum_of_squared_weights.sqrt()
        }
    }

    /// Proximity factor for sloppy phrase matches.
    fn sloppy_freq(&self, distance: u32) -> f32 {
        1.0 / (distance as f32 + 1.0)
    }
}

#[derive(Debug, Default)]
pub struct DefaultSimilarity;

impl Similarity for DefaultSimilarity {}

// Norms store one byte per (doc, field): an 8-bit float with a 3-bit
// mantissa and a zero exponent of 15, trading precision for space. The
// covered range is roughly 7e-10 .. 7.5e9.
const MANTISSA_BITS: i32 = 3;
const ZERO_EXP: i32 = 15;
const F_ZERO: i32 = (63 - ZERO_EXP) << MANTISSA_BITS;

pub fn encode_norm(f: f32) -> u8 {
    let bits = f.to_bits() as i32;
    let small = bits >> (24 - MANTISSA_BITS);
    if small <= F_ZERO {
        if bits <= 0 {
            0
        } else {
            1
        }
    } else if small >= F_ZERO + 0x100 {
        255
    } else {
        (small - F_ZERO) as u8
    }
}

pub fn decode_norm(b: u8) -> f32 {
    if b == 0 {
        return 0.0;
    }
    let mut bits = (b as i32) << (24 - MANTISSA_BITS);
    bits += (63 - ZERO_EXP) << 24;
    f32::from_bits(bits as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_bytes_round_trip_exactly() {
        for b in 0..=255u8 {
            assert_eq!(encode_norm(decode_norm(b)), b, "byte {b}");
        }
    }

    #[test]
    fn norm_encoding_is_monotonic() {
        let mut last = decode_norm(0);
        for b in 1..=255u8 {
            let value = decode_norm(b);
            assert!(value > last, "byte {b}");
            last = value;
        }
    }

    #[test]
    fn encode_clamps_extremes() {
        assert_eq!(encode_norm(0.0), 0);
        assert_eq!(encode_norm(-1.0), 0);
        assert_eq!(encode_norm(f32::MAX), 255);
        // tiny positive values round up to the smallest nonzero code
        assert_eq!(encode_norm(1e-20), 1);
    }

    #[test]
    fn default_similarity_formulas() {
        let sim = DefaultSimilarity;
        assert_eq!(sim.tf(4.0), 2.0);
        assert_eq!(sim.coord(2, 4), 0.5);
        assert_eq!(sim.length_norm("f", 4), 0.5);
        assert!(sim.idf(1, 100) > sim.idf(50, 100));
        assert_eq!(sim.sloppy_freq(0), 1.0);
        assert_eq!(sim.sloppy_freq(1), 0.5);
    }
}
