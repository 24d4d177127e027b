//! Low-level nftables text emission.
//!
//! The compiler builds its output through [`Emitter`], which owns
//! indentation and line discipline.  Keeping all text production here makes
//! the byte-identical-output guarantee easy to audit: the emitter appends
//! lines in call order and nothing else.

use std::fmt::Write;

//----------- Emitter ----------------------------------------------------------

/// An indentation-aware text sink.
pub struct Emitter {
    out: String,
    depth: usize,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            out: String::new(),
            depth: 0,
        }
    }

    /// Append one line at the current indentation.
    pub fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    /// Append an empty line.
    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Open a `name {` block.
    pub fn open(&mut self, header: impl AsRef<str>) {
        let mut line = header.as_ref().to_owned();
        line.push_str(" {");
        self.line(line);
        self.depth += 1;
    }

    /// Close the innermost block.
    pub fn close(&mut self) {
        self.depth = self.depth.checked_sub(1).expect("unbalanced close");
        self.line("}");
    }

    /// The finished text.
    pub fn finish(self) -> String {
        assert_eq!(self.depth, 0, "unbalanced emitter blocks");
        self.out
    }
}

/// Render a list of rendered elements as an nftables anonymous set.
///
/// A single element is emitted bare; multiple elements get brace syntax.
pub fn braced(elements: &[String]) -> String {
    match elements {
        [single] => single.clone(),
        many => {
            let mut out = String::from("{ ");
            for (i, elem) in many.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{elem}");
            }
            out.push_str(" }");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_indents_by_four() {
        let mut e = Emitter::new();
        e.open("table inet t");
        e.open("chain c");
        e.line("accept");
        e.close();
        e.close();
        assert_eq!(
            e.finish(),
            "table inet t {\n    chain c {\n        accept\n    }\n}\n"
        );
    }

    #[test]
    fn braced_singleton_is_bare() {
        assert_eq!(braced(&["22".into()]), "22");
        assert_eq!(braced(&["22".into(), "80".into()]), "{ 22, 80 }");
    }
}
