use crate::domain::ports::ReferenceGenerator;
use crate::domain::transaction::Reference;
use rand::RngCore;
use rand::rngs::OsRng;

/// Hex-encoded references drawn from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReferenceGenerator;

impl ReferenceGenerator for RandomReferenceGenerator {
    fn generate(&self, length: usize) -> Reference {
        let mut buf = vec![0u8; length];
        OsRng.fill_bytes(&mut buf);
        Reference::new(hex::encode(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_reference_shape() {
        let reference = RandomReferenceGenerator.generate(12);
        assert_eq!(reference.as_str().len(), 24);
        assert!(reference.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_no_collisions_in_ten_thousand() {
        let generator = RandomReferenceGenerator;
        let references: HashSet<Reference> = (0..10_000).map(|_| generator.generate(12)).collect();
        assert_eq!(references.len(), 10_000);
    }
}
