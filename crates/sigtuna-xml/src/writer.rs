#![forbid(unsafe_code)]

//! String-building XML writer used for marshaling signature and
//! encryption structures.
//!
//! Output is deliberately plain: no pretty-printing, no declaration
//! unless asked for, attributes in the order given.  Marshaled elements
//! are spliced into existing documents, so any added whitespace would
//! change digests.

/// A minimal XML writer.
pub struct XmlWriter {
    out: String,
    open: Vec<String>,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            out: String::new(),
            open: Vec::new(),
        }
    }

    /// Open an element with the given attributes.  Attributes with a
    /// `None` value are omitted.
    pub fn start_element(&mut self, name: &str, attrs: &[(&str, Option<&str>)]) {
        self.out.push('<');
        self.out.push_str(name);
        for (k, v) in attrs {
            if let Some(v) = v {
                self.out.push(' ');
                self.out.push_str(k);
                self.out.push_str("=\"");
                self.out.push_str(&escape_attr_value(v));
                self.out.push('"');
            }
        }
        self.out.push('>');
        self.open.push(name.to_owned());
    }

    /// Write a self-closing element.
    pub fn empty_element(&mut self, name: &str, attrs: &[(&str, Option<&str>)]) {
        self.out.push('<');
        self.out.push_str(name);
        for (k, v) in attrs {
            if let Some(v) = v {
                self.out.push(' ');
                self.out.push_str(k);
                self.out.push_str("=\"");
                self.out.push_str(&escape_attr_value(v));
                self.out.push('"');
            }
        }
        self.out.push_str("/>");
    }

    /// Close the most recently opened element.
    pub fn end_element(&mut self) {
        if let Some(name) = self.open.pop() {
            self.out.push_str("</");
            self.out.push_str(&name);
            self.out.push('>');
        }
    }

    /// Write escaped character content.
    pub fn text(&mut self, text: &str) {
        self.out.push_str(&escape_text(text));
    }

    /// Write pre-serialized XML verbatim.
    pub fn raw(&mut self, xml: &str) {
        self.out.push_str(xml);
    }

    pub fn into_string(mut self) -> String {
        while !self.open.is_empty() {
            self.end_element();
        }
        self.out
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_elements_and_escaping() {
        let mut w = XmlWriter::new();
        w.start_element("a", &[("x", Some("1<2")), ("skip", None)]);
        w.text("b&c");
        w.empty_element("e", &[]);
        w.end_element();
        assert_eq!(w.into_string(), r#"<a x="1&lt;2">b&amp;c<e/></a>"#);
    }

    #[test]
    fn unclosed_elements_closed_on_finish() {
        let mut w = XmlWriter::new();
        w.start_element("a", &[]);
        w.start_element("b", &[]);
        assert_eq!(w.into_string(), "<a><b></b></a>");
    }
}
