//! Expansion of the encrypted message templates shown on failure.

use crate::crypto::StringCipher;

/// Upper bound on an expanded message, terminator excluded.
pub const MAX_MESSAGE_LEN: usize = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InitializationError,
    ProcNotFound,
    OrdinalNotFound,
    FileCorrupted,
    DebuggerFound,
    UnregisteredVersion,
    VirtualMachineFound,
}

impl MessageKind {
    /// Only these templates carry `%` placeholders.
    pub fn takes_arguments(self) -> bool {
        matches!(
            self,
            MessageKind::InitializationError | MessageKind::ProcNotFound | MessageKind::OrdinalNotFound
        )
    }

    /// The nag is a warning; everything else is an error.
    pub fn is_warning(self) -> bool {
        self == MessageKind::UnregisteredVersion
    }
}

/// One substitution value.
#[derive(Debug, Clone, Copy)]
pub enum MessageArg<'a> {
    /// `%s`: bytes copied verbatim.
    Plain(&'a [u8]),
    /// `%c`: bytes decrypted with the string cipher.
    Encrypted(&'a [u8]),
    /// `%d`: unsigned decimal.
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

/// Decrypt `template` and substitute `args` in order.
///
/// Returns `None` when the expanded text is empty; the build-time tool
/// writes an empty template to switch a message off.
pub fn format_message(
    cipher: &StringCipher,
    kind: MessageKind,
    template: &[u8],
    args: &[MessageArg<'_>],
) -> Option<Message> {
    let mut out: Vec<u8> = Vec::new();
    let mut next_arg = args.iter();
    let mut j = 0;

    let at = |j: usize| template.get(j).map_or(0, |&b| cipher.decrypt_byte(b, j));

    while out.len() < MAX_MESSAGE_LEN {
        let c = at(j);
        if c == 0 {
            break;
        }
        if kind.takes_arguments() && c == b'%' {
            j += 1;
            let conv = at(j);
            let arg = next_arg.next();
            match (conv, arg) {
                (b's', Some(MessageArg::Plain(s))) => push_bounded(&mut out, s.iter().copied()),
                (b'c', Some(MessageArg::Encrypted(s))) => {
                    let plain = (0..s.len())
                        .map(|k| cipher.decrypt_byte(s[k], k))
                        .take_while(|&b| b != 0);
                    push_bounded(&mut out, plain)
                }
                (b'd', Some(MessageArg::Number(n))) => {
                    push_bounded(&mut out, n.to_string().into_bytes())
                }
                // A mismatched argument still consumes its slot.
                (b's' | b'c' | b'd', Some(other)) => push_arg_lossy(cipher, &mut out, other),
                _ => {}
            }
            if conv == 0 {
                break;
            }
        } else {
            out.push(c);
        }
        j += 1;
    }

    if out.is_empty() {
        return None;
    }
    Some(Message {
        kind,
        text: String::from_utf8_lossy(&out).into_owned(),
    })
}

fn push_bounded(out: &mut Vec<u8>, bytes: impl IntoIterator<Item = u8>) {
    for b in bytes {
        if out.len() >= MAX_MESSAGE_LEN {
            break;
        }
        out.push(b);
    }
}

fn push_arg_lossy(cipher: &StringCipher, out: &mut Vec<u8>, arg: &MessageArg<'_>) {
    match *arg {
        MessageArg::Plain(s) => push_bounded(out, s.iter().copied()),
        MessageArg::Encrypted(s) => {
            let plain = cipher.decrypt(s, MAX_MESSAGE_LEN).unwrap_or_default();
            push_bounded(out, plain)
        }
        MessageArg::Number(n) => push_bounded(out, n.to_string().into_bytes()),
    }
}
