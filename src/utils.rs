use std::fmt;

// Wraps a [fmt::Write] to prepend [str] to each line.
pub struct LinePrefixWrite<'a, W: fmt::Write>(W, &'a str, bool);

impl<'a, W: fmt::Write> LinePrefixWrite<'a, W> {
    pub fn new(inner: W, line_prefix: &'a str) -> Self {
        LinePrefixWrite(inner, line_prefix, true)
    }
}

impl<W: fmt::Write> fmt::Write for LinePrefixWrite<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.2 && !s.is_empty() {
            self.0.write_str(self.1)?;
        }

        let mut split_iter = s.split_inclusive('\n').peekable();
        while let Some(substring) = split_iter.next() {
            self.0.write_str(substring)?;
            if split_iter.peek().is_some() {
                self.0.write_str(self.1)?;
            }
        }
        self.2 = s.ends_with('\n');
        Ok(())
    }
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Split `content` into sections separated by runs of blank lines.
///
/// Leading and trailing whitespace of the whole text is ignored, as are trailing spaces on
/// otherwise-empty lines.
///
/// # Examples
/// ```
/// # use opcheck::utils::split_sections;
/// assert_eq!(split_sections("a\nb\n\n\nc\n"), vec!["a\nb", "c"]);
/// assert_eq!(split_sections("  \n"), Vec::<String>::new());
/// ```
pub fn split_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.trim().lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                sections.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_lineprefixwrite_prefixes_each_line() {
        let mut write = LinePrefixWrite::new(String::new(), "  ");
        writeln!(write, "Tups:").unwrap();
        writeln!(write, "EinTup 'a': [1]").unwrap();
        assert_eq!(write.0, "  Tups:\n  EinTup 'a': [1]\n");
    }

    #[test]
    fn test_lineprefixwrite_multiline_str() {
        let mut write = LinePrefixWrite::new(String::new(), "> ");
        write!(write, "x\ny").unwrap();
        assert_eq!(write.0, "> x\n> y");
    }

    #[test]
    fn test_lineprefixwrite_noop_with_empty_string() {
        let mut write = LinePrefixWrite::new(String::new(), "--");
        write!(write, "").unwrap();
        assert_eq!(write.0, "");
    }

    #[test]
    fn test_join_into_string() {
        assert_eq!(join_into_string([1, 2, 3], ","), "1,2,3");
        assert_eq!(join_into_string(Vec::<u32>::new(), ","), "");
    }

    #[test]
    fn test_split_sections_ignores_whitespace_only_separators() {
        let text = "s1\ns2\n   \n\ncall()\n\nout\n";
        assert_eq!(split_sections(text), vec!["s1\ns2", "call()", "out"]);
    }
}
