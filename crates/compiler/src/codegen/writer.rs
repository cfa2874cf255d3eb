//! Indent-tracking text emitter for generated C.
//!
//! Every emission site appends whole lines; the writer owns the indent
//! counter so brace pairs stay balanced by construction. Output goes into a
//! plain `String` and nothing is written to the outside world until the
//! whole unit generated successfully.

pub struct Writer {
    out: String,
    indent: usize,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            out: String::new(),
            indent: 0,
        }
    }

    /// One line at the current indent.
    pub fn o(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if line.is_empty() {
            self.out.push('\n');
            return;
        }
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(line);
        self.out.push('\n');
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// `head {` and one level deeper.
    pub fn open(&mut self, head: impl AsRef<str>) {
        let head = head.as_ref();
        if head.is_empty() {
            self.o("{");
        } else {
            self.o(format!("{} {{", head));
        }
        self.indent += 1;
    }

    /// Close a block opened with [`Writer::open`].
    pub fn close(&mut self) {
        debug_assert!(self.indent > 0, "unbalanced close()");
        self.indent -= 1;
        self.o("}");
    }

    /// Close a block that is also a declaration (`};`).
    pub fn close_stmt(&mut self) {
        debug_assert!(self.indent > 0, "unbalanced close_stmt()");
        self.indent -= 1;
        self.o("};");
    }

    /// A goto label, outdented one level for readability.
    pub fn label(&mut self, name: impl AsRef<str>) {
        let saved = self.indent;
        self.indent = saved.saturating_sub(1);
        self.o(format!("{}:", name.as_ref()));
        self.indent = saved;
    }

    /// Verbatim lines, re-indented to the current level.
    pub fn raw(&mut self, text: &str) {
        for line in text.lines() {
            self.o(line.trim_end());
        }
    }

    pub fn finish(self) -> String {
        debug_assert_eq!(self.indent, 0, "unbalanced blocks at finish()");
        self.out
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indentation_and_blocks() {
        let mut w = Writer::new();
        w.open("int f(void)");
        w.o("int x = 0;");
        w.open("if (x)");
        w.o("x = 1;");
        w.close();
        w.close();
        assert_eq!(
            w.finish(),
            "int f(void) {\n    int x = 0;\n    if (x) {\n        x = 1;\n    }\n}\n"
        );
    }

    #[test]
    fn test_label_outdents() {
        let mut w = Writer::new();
        w.open("void f(void)");
        w.label("STOP");
        w.o("return;");
        w.close();
        assert_eq!(w.finish(), "void f(void) {\nSTOP:\n    return;\n}\n");
    }

    #[test]
    fn test_close_stmt() {
        let mut w = Writer::new();
        w.open("struct point");
        w.o("int x;");
        w.close_stmt();
        assert_eq!(w.finish(), "struct point {\n    int x;\n};\n");
    }
}
