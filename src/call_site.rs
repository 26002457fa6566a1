//! Call-site classification over decoded instruction streams
//!
//! During sample attribution the profiler needs to know whether the
//! instruction a thread is stopped at is a call, to distinguish native from
//! interpreted execution time. The classification is pure (the same code
//! unit and offset always yield the same answer), so results are memoized in
//! a cache owned by the classifier and scoped to the analysis session.

use fnv::FnvHashMap;

/// Opcode-mnemonic prefix shared by the call-instruction family
pub const CALL_FAMILY_PREFIX: &str = "CALL_FUNCTION";

/// One decoded instruction of a code unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Byte offset at which the instruction starts
    pub offset: u32,
    /// Opcode mnemonic (e.g. "CALL_FUNCTION_KW", "LOAD_FAST")
    pub mnemonic: String,
}

impl Instruction {
    pub fn new(offset: u32, mnemonic: impl Into<String>) -> Self {
        Self {
            offset,
            mnemonic: mnemonic.into(),
        }
    }
}

/// A code unit decomposed into its instruction stream.
///
/// `id` is the identity of the code object; it keys the classifier cache so
/// distinct code units with coincident offsets cannot cross-contaminate.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub id: u64,
    pub instructions: Vec<Instruction>,
}

impl CodeUnit {
    pub fn new(id: u64, instructions: Vec<Instruction>) -> Self {
        Self { id, instructions }
    }
}

/// Classifies whether a byte offset within a code unit is a call instruction
#[derive(Debug, Default)]
pub struct CallSiteClassifier {
    cache: FnvHashMap<(u64, u32), bool>,
}

impl CallSiteClassifier {
    /// Create a classifier with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the instruction starting exactly at `offset` belongs to the
    /// call family. An offset that starts no instruction yields false.
    pub fn is_call_instruction(&mut self, code: &CodeUnit, offset: u32) -> bool {
        if let Some(&cached) = self.cache.get(&(code.id, offset)) {
            return cached;
        }
        let result = code
            .instructions
            .iter()
            .any(|ins| ins.offset == offset && ins.mnemonic.starts_with(CALL_FAMILY_PREFIX));
        self.cache.insert((code.id, offset), result);
        result
    }

    /// Number of memoized classifications
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_code(id: u64) -> CodeUnit {
        CodeUnit::new(
            id,
            vec![
                Instruction::new(0, "LOAD_FAST"),
                Instruction::new(2, "CALL_FUNCTION"),
                Instruction::new(4, "CALL_FUNCTION_KW"),
                Instruction::new(6, "RETURN_VALUE"),
            ],
        )
    }

    #[test]
    fn test_call_offset_classified_true() {
        let mut classifier = CallSiteClassifier::new();
        let code = sample_code(1);
        assert!(classifier.is_call_instruction(&code, 2));
        assert!(classifier.is_call_instruction(&code, 4));
    }

    #[test]
    fn test_non_call_offset_classified_false() {
        let mut classifier = CallSiteClassifier::new();
        let code = sample_code(1);
        assert!(!classifier.is_call_instruction(&code, 0));
        assert!(!classifier.is_call_instruction(&code, 6));
    }

    #[test]
    fn test_invalid_offset_is_false() {
        let mut classifier = CallSiteClassifier::new();
        let code = sample_code(1);
        // Offset 3 starts no instruction.
        assert!(!classifier.is_call_instruction(&code, 3));
        assert!(!classifier.is_call_instruction(&code, 999));
    }

    #[test]
    fn test_results_are_memoized() {
        let mut classifier = CallSiteClassifier::new();
        let code = sample_code(7);
        assert!(classifier.is_call_instruction(&code, 2));
        assert!(classifier.is_call_instruction(&code, 2));
        assert_eq!(classifier.cached_entries(), 1);
    }

    #[test]
    fn test_cache_keys_include_code_identity() {
        let mut classifier = CallSiteClassifier::new();
        let with_call = sample_code(1);
        let without_call = CodeUnit::new(2, vec![Instruction::new(2, "LOAD_CONST")]);
        assert!(classifier.is_call_instruction(&with_call, 2));
        // Same offset, different code unit: must not reuse the cached answer.
        assert!(!classifier.is_call_instruction(&without_call, 2));
        assert_eq!(classifier.cached_entries(), 2);
    }
}
