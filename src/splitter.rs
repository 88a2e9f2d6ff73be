/// Stage-one completion separated into the image description and the raw question lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCompletion {
    pub description: String,
    pub questions: Vec<String>,
}

/// Splits a stage-one completion at the first occurrence of `marker`.
///
/// The marker is matched ASCII case-insensitively. Text before it, trimmed,
/// becomes the description; lines at or after it that end with `?` become the
/// questions, in order. Without a marker the whole text is the description and
/// is also scanned for questions. No cap is applied here.
pub fn split(text: &str, marker: &str) -> SplitCompletion {
    let text = normalize_line_endings(text);

    let (description, remainder) = match find_marker(&text, marker) {
        Some(offset) => (text[..offset].trim().to_string(), &text[offset..]),
        None => (text.clone(), text.as_str()),
    };

    let questions = remainder
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.ends_with('?'))
        .map(str::to_string)
        .collect();

    SplitCompletion {
        description,
        questions,
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Byte offset of the first case-insensitive occurrence of `marker`.
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    let needle = marker.as_bytes();
    text.char_indices().map(|(i, _)| i).find(|&i| {
        text.as_bytes()
            .get(i..i + needle.len())
            .is_some_and(|window| window.eq_ignore_ascii_case(needle))
    })
}
