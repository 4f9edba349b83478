//! Named "special key" tokens to their canonical ANSI byte sequences
//! (spec §4.4 `sendInput`). Anything not recognized here is delivered
//! verbatim as raw bytes.

/// Translates a special-key token (e.g. `"arrow_up"`) to its ANSI escape
/// sequence. Returns `None` for tokens that aren't recognized special
/// keys, signaling the caller to send the text verbatim instead.
pub fn translate(token: &str) -> Option<&'static [u8]> {
    Some(match token {
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "enter" => b"\r",
        "shift_enter" => b"\x1b\r",
        "ctrl_enter" => b"\n",
        "escape" => b"\x1b",
        "tab" => b"\t",
        "shift_tab" => b"\x1b[Z",
        "backspace" => b"\x7f",
        "delete" => b"\x1b[3~",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "page_up" => b"\x1b[5~",
        "page_down" => b"\x1b[6~",
        "ctrl_c" => b"\x03",
        "ctrl_d" => b"\x04",
        "ctrl_z" => b"\x1a",
        _ => return None,
    })
}

/// Resolves a client input payload to the raw bytes that should be
/// written to the PTY: a recognized special-key name translates to its
/// ANSI sequence, everything else passes through verbatim as UTF-8.
pub fn resolve_input(text: &str) -> Vec<u8> {
    match translate(text) {
        Some(seq) => seq.to_vec(),
        None => text.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_up_is_canonical_ansi() {
        assert_eq!(resolve_input("arrow_up"), b"\x1b[A".to_vec());
    }

    #[test]
    fn unrecognized_text_passes_through_verbatim() {
        assert_eq!(resolve_input("date\n"), b"date\n".to_vec());
        assert_eq!(resolve_input("hello world"), b"hello world".to_vec());
    }
}
