use std::path::Path;

/// Longest output body kept in a result block, and the size of each outbound chunk.
pub const MAX_MESSAGE_CHARS: usize = 3500;
pub const TRUNCATION_MARKER: &str = "\n...[truncated]...";

/// Renders the result block sent back to the operator and written to the audit log.
pub fn render(cwd: &Path, command: &str, exit_code: i32, output: &str) -> String {
    let body = truncate_output(output);
    format!(
        "[DIR] {}\n[CMD] {command}\n[RC]  {exit_code}\n\n[OUT]\n{body}",
        cwd.display()
    )
}

pub fn truncate_output(output: &str) -> String {
    match output.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &output[..cut]),
        None => output.to_owned(),
    }
}

/// Splits `text` at hard `size`-character boundaries. No attempt is made to respect line or
/// word breaks.
pub fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_four_field_block() {
        let block = render(Path::new("/home/op"), "ls -la", 0, "a\nb");
        assert_eq!(block, "[DIR] /home/op\n[CMD] ls -la\n[RC]  0\n\n[OUT]\na\nb");
    }

    #[test]
    fn short_output_is_untouched() {
        let exact = "x".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(truncate_output(&exact), exact);
    }

    #[test]
    fn long_output_keeps_the_head_and_gains_a_marker() {
        let long = "é".repeat(MAX_MESSAGE_CHARS + 10);
        let truncated = truncate_output(&long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        let head = truncated.strip_suffix(TRUNCATION_MARKER).unwrap_or_default();
        assert_eq!(head.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn render_truncates_before_chunking() {
        let output = "y".repeat(MAX_MESSAGE_CHARS * 2);
        let block = render(Path::new("/"), "yes", 0, &output);
        assert!(block.ends_with(TRUNCATION_MARKER));

        let chunks = split_chunks(&block, MAX_MESSAGE_CHARS);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(chunks.concat(), block);
    }

    #[test]
    fn chunks_cover_consecutive_ranges() {
        let text: String = (0..7200).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = split_chunks(&text, MAX_MESSAGE_CHARS);
        assert_eq!(chunks.len(), 3);
        for (k, chunk) in chunks.iter().enumerate() {
            let start = k * MAX_MESSAGE_CHARS;
            let end = (start + MAX_MESSAGE_CHARS).min(text.len());
            assert_eq!(chunk, &text[start..end]);
        }
        assert_eq!(chunks[2].len(), 200);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(split_chunks("", MAX_MESSAGE_CHARS).is_empty());
    }
}
