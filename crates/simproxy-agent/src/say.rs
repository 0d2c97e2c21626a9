//! Say sub-command validation
//!
//! Agents may embed one `(say <message>)` in an action. The server only
//! accepts printable ASCII without spaces or parentheses in the message, and
//! a malformed say can confuse its parser. Validation here is observational:
//! results feed a counter, the payload is forwarded untouched.

use simproxy_proto::SAY_MARKER;

/// Tunables for say validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SayPolicy {
    /// Treat `"` inside the message as invalid
    pub reject_quotes: bool,
}

/// Why a say sub-command was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SayViolation {
    /// The first `)` is followed by something other than `(` or the end of the action
    MisplacedBoundary,
    /// No `)` closes the sub-command
    Unterminated,
    /// Disallowed byte inside the message
    InvalidCharacter(u8),
}

/// Result of validating one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SayVerdict {
    /// The action carries no say sub-command
    Absent,
    Valid,
    Invalid(SayViolation),
}

impl SayVerdict {
    pub fn is_invalid(&self) -> bool {
        matches!(self, SayVerdict::Invalid(_))
    }
}

/// Validate the first say sub-command in `action`
pub fn check_say(action: &[u8], policy: SayPolicy) -> SayVerdict {
    let Some(start) = find(action, SAY_MARKER, 0) else {
        return SayVerdict::Absent;
    };

    let Some(end) = find(action, b")", start) else {
        return SayVerdict::Invalid(SayViolation::Unterminated);
    };

    if let Some(&next) = action.get(end + 1) {
        if next != b'(' {
            return SayVerdict::Invalid(SayViolation::MisplacedBoundary);
        }
    }

    // Skip the marker and the separator that follows it
    let content_start = (start + SAY_MARKER.len() + 1).min(end);
    for &byte in &action[content_start..end] {
        if !is_allowed(byte, policy) {
            return SayVerdict::Invalid(SayViolation::InvalidCharacter(byte));
        }
    }

    SayVerdict::Valid
}

fn is_allowed(byte: u8, policy: SayPolicy) -> bool {
    match byte {
        b' ' | b'(' | b')' => false,
        b'"' => !policy.reject_quotes,
        33..=126 => true,
        _ => false,
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
