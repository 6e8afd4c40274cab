//! Inline `&`-code color markup. Text is authored with `&N` codes and
//! rendered per session at send time: ANSI escapes for sessions that asked
//! for color, stripped otherwise. `&&` is a literal ampersand either way.

const RESET: &str = "\x1b[0m";

fn ansi_for(code: u8) -> Option<&'static str> {
    Some(match code {
        b'0' => RESET,
        b'1' => "\x1b[31m",
        b'2' => "\x1b[32m",
        b'3' => "\x1b[33m",
        b'4' => "\x1b[34m",
        b'5' => "\x1b[35m",
        b'6' => "\x1b[36m",
        b'7' => "\x1b[37m",
        b'8' => "\x1b[1m",
        b'9' => "\x1b[4m",
        b'b' => "\x1b[1m",
        _ => return None,
    })
}

/// Render `&`-codes for one session. Unknown codes are dropped silently so
/// stray markup never leaks to the client. A lone trailing `&` is dropped.
pub fn process(text: &str, color: bool) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            match bytes.get(i + 1) {
                Some(b'&') => {
                    out.push('&');
                    i += 2;
                }
                Some(&c) => {
                    if color {
                        if let Some(seq) = ansi_for(c) {
                            out.push_str(seq);
                        }
                    }
                    i += 2;
                }
                None => break,
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

/// Printable column count, skipping both unrendered `&`-codes and already
/// rendered ANSI CSI sequences. Used by the pager for line wrapping.
pub fn visible_width(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut width = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'&' if i + 1 < bytes.len() => {
                if bytes[i + 1] == b'&' {
                    width += 1;
                }
                i += 2;
            }
            0x1b => {
                i += 1;
                if bytes.get(i) == Some(&b'[') {
                    i += 1;
                    while i < bytes.len() && !bytes[i].is_ascii_alphabetic() {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {
                width += 1;
                i += 1;
            }
        }
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_codes_when_color_on() {
        assert_eq!(process("&1hi&0", true), "\x1b[31mhi\x1b[0m");
    }

    #[test]
    fn strips_codes_when_color_off() {
        assert_eq!(process("&1hi&0", false), "hi");
    }

    #[test]
    fn double_ampersand_is_literal_in_both_modes() {
        assert_eq!(process("tom && jerry", true), "tom & jerry");
        assert_eq!(process("tom && jerry", false), "tom & jerry");
    }

    #[test]
    fn drops_unknown_code_and_trailing_ampersand() {
        assert_eq!(process("a&zb&", true), "ab");
        assert_eq!(process("a&zb&", false), "ab");
    }

    #[test]
    fn width_ignores_markup() {
        assert_eq!(visible_width("&1hello&0"), 5);
        assert_eq!(visible_width("\x1b[31mhello\x1b[0m"), 5);
        assert_eq!(visible_width("a && b"), 5);
    }
}
