use crate::facts::{CallingConvention, ProgramFacts, ARGUMENT_SLOTS};
use crate::profile::{AnalysisProfile, SafetyCheck};

/// Reads call arguments through the binary's calling convention.
pub struct ArgumentReader<'f, F: ProgramFacts + ?Sized> {
    facts: &'f F,
    convention: CallingConvention,
}

impl<'f, F: ProgramFacts + ?Sized> ArgumentReader<'f, F> {
    pub fn new(facts: &'f F) -> Self {
        Self { facts, convention: facts.arch().calling_convention() }
    }

    /// Propagated value in argument `slot` at the call at `call`.
    pub fn argument_value(&self, call: u64, slot: usize) -> Option<u64> {
        let location = self.convention.argument_location(self.facts, call, slot)?;
        self.facts.register_value(location.address, &location.register)
    }

    /// Read a NUL-terminated UTF-8 string (lossy); `None` if any byte before the terminator is
    /// unmapped.
    pub fn read_c_string(&self, address: u64) -> Option<String> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        loop {
            let byte = self.facts.read_byte(cursor)?;
            if byte == 0 {
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
            cursor = cursor.checked_add(1)?;
        }
    }

    /// The string pointed to by argument `slot`, if it resolves to readable memory.
    pub fn string_argument(&self, call: u64, slot: usize) -> Option<String> {
        let pointer = self.argument_value(call, slot)?;
        self.read_c_string(pointer)
    }

    /// Whether argument `slot` is a compile-time constant string.
    ///
    /// Empty strings do not count: they are as likely to be an uninitialized
    /// global buffer as a literal.
    pub fn is_constant_string(&self, call: u64, slot: usize) -> bool {
        self.string_argument(call, slot).is_some_and(|s| !s.is_empty())
    }

    /// Whether the format string in `slot` only expands `%s` conversions whose
    /// arguments are constant strings in resolvable slots.
    pub fn is_safe_format(&self, call: u64, slot: usize) -> bool {
        let Some(format) = self.string_argument(call, slot) else {
            return false;
        };
        let bytes = format.as_bytes();
        let mut conversion_slot = slot;
        for pair in bytes.windows(2) {
            if pair[0] != b'%' || pair[1] == b'%' {
                continue;
            }
            conversion_slot += 1;
            if pair[1] == b's'
                && (conversion_slot >= ARGUMENT_SLOTS
                    || !self.is_constant_string(call, conversion_slot))
            {
                return false;
            }
        }
        true
    }
}

/// Classifies digest calls against the profile's safety policy.
pub struct SafetyChecker<'f, F: ProgramFacts + ?Sized> {
    reader: ArgumentReader<'f, F>,
    profile: &'f AnalysisProfile,
}

impl<'f, F: ProgramFacts + ?Sized> SafetyChecker<'f, F> {
    pub fn new(facts: &'f F, profile: &'f AnalysisProfile) -> Self {
        Self { reader: ArgumentReader::new(facts), profile }
    }

    pub fn reader(&self) -> &ArgumentReader<'f, F> {
        &self.reader
    }

    pub fn passes(&self, call: u64, check: SafetyCheck) -> bool {
        match check {
            SafetyCheck::ConstantString { slot } => self.reader.is_constant_string(call, slot),
            SafetyCheck::SafeFormat { slot } => self.reader.is_safe_format(call, slot),
        }
    }

    /// A digest call is unsafe unless one of its applicable checks passes.
    pub fn is_unsafe_digest(&self, call: u64, callee: &str) -> bool {
        if !self.profile.is_digest(callee) {
            return false;
        }
        !self.profile.safety_checks(callee).into_iter().any(|check| self.passes(call, check))
    }
}
