/// Writes one formatted line per argument group at the writer's current indentation.
macro_rules! code {
    {$w:expr; $($fmt:literal $(, $arg:expr)*);+ $(;)?} => {{
        $($w.line(format!($fmt $(, $arg)*));)+
    }};
}

const INDENT: &str = "    ";

/// Line-oriented text buffer with brace-block indentation.
#[derive(Debug, Default)]
pub struct Writer {
    out: String,
    depth: usize,
}

impl Writer {
    pub fn new() -> Writer {
        Writer::default()
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push_str(INDENT);
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    /// Writes a multi-line fragment, re-indenting every line.
    pub fn lines(&mut self, text: &str) {
        for line in text.lines() {
            self.line(line);
        }
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    pub fn open(&mut self, head: impl AsRef<str>) {
        self.line(head);
        self.line("{");
        self.depth += 1;
    }

    pub fn close(&mut self) {
        self.close_with("}");
    }

    /// Closes a block with a custom closing line such as `};`.
    pub fn close_with(&mut self, tail: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(tail);
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn finish(self) -> String {
        self.out
    }
}
