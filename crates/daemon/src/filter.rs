//! Terminal escape stripping and chat rendering.
//!
//! Shell output is full of control sequences (colors, cursor movement,
//! title updates) that render as garbage in a chat client. [`strip`] runs
//! the output through a `vte` parser and keeps only the printable text;
//! there is no screen model.

use vte::{Params, Parser, Perform};

/// The escape character that introduces every control sequence.
pub const ESC: char = '\u{1b}';

/// Strips escape sequences from raw shell output.
///
/// Printable text, newlines and tabs are kept. Carriage returns are kept
/// only before the first stripped sequence (shells redraw the prompt with
/// `\r`, which would otherwise duplicate lines). Other control characters
/// are dropped, as is an incomplete sequence at the end of the input. Text
/// without any escape character is returned unchanged.
///
/// Besides what `vte` recognizes, the short form `ESC` digits/semicolons
/// letter (no `[`) is dropped as one sequence.
///
/// The output never contains ESC, so `strip(strip(x)) == strip(x)`.
pub fn strip(raw: &str) -> String {
    if !raw.contains(ESC) {
        return raw.to_string();
    }

    let mut text = PlainText {
        out: String::with_capacity(raw.len()),
        after_sequence: false,
        in_short_form: false,
    };
    let mut parser: Parser = Parser::new();
    parser.advance(&mut text, raw.as_bytes());
    text.out
}

/// Collects the printable side of a parsed byte stream.
struct PlainText {
    out: String,
    after_sequence: bool,
    /// Inside `ESC` digits/semicolons, waiting for the closing letter.
    in_short_form: bool,
}

impl PlainText {
    fn sequence_ended(&mut self) {
        self.after_sequence = true;
        self.in_short_form = false;
    }
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        if self.in_short_form {
            if c.is_ascii_digit() || c == ';' {
                return;
            }
            self.in_short_form = false;
            if c.is_ascii_alphabetic() {
                return;
            }
        }
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        self.in_short_form = false;
        match byte {
            b'\n' => self.out.push('\n'),
            b'\t' => self.out.push('\t'),
            b'\r' if !self.after_sequence => self.out.push('\r'),
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {
        self.sequence_ended();
    }

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {
        self.sequence_ended();
    }

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {
        self.sequence_ended();
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        self.sequence_ended();
        // vte ends the sequence at the first digit; the rest arrives as text.
        self.in_short_form = intermediates.is_empty() && (byte.is_ascii_digit() || byte == b';');
    }
}

/// Returns true if the text has nothing worth relaying.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Renders stripped output as a preformatted HTML block.
pub fn render_html(text: &str) -> String {
    let mut html = String::with_capacity(text.len() + 24);
    html.push_str("<pre><code>");
    for c in text.chars() {
        match c {
            '&' => html.push_str("&amp;"),
            '<' => html.push_str("&lt;"),
            '>' => html.push_str("&gt;"),
            '"' => html.push_str("&quot;"),
            '\'' => html.push_str("&#39;"),
            _ => html.push(c),
        }
    }
    html.push_str("</code></pre>");
    html
}

/// Splits text into parts of at most `max_bytes`, cutting after a newline
/// where one is available and never inside a UTF-8 character.
pub fn split_message(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text;

    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(newline) = rest[..cut].rfind('\n') {
            cut = newline + 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        parts.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}
