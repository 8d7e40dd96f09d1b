//! Order-independent name tokens for fuzzy blocking.

/// Every combination of `size` words of `full_name`, taken from the
/// alphabetically sorted word list and joined by a single space.
///
/// Sorting first makes `"ivanova anna"` and `"anna ivanova"` produce the same
/// tokens. A name with fewer than `size` words yields nothing.
pub fn tokenize(full_name: &str, size: usize) -> Vec<String> {
    let mut words: Vec<&str> = full_name.split_whitespace().collect();
    if size == 0 || words.len() < size {
        return Vec::new();
    }
    words.sort_unstable();

    let mut tokens = Vec::new();
    let mut picked = Vec::with_capacity(size);
    combine(&words, size, 0, &mut picked, &mut tokens);
    tokens
}

fn combine<'a>(
    words: &[&'a str],
    size: usize,
    start: usize,
    picked: &mut Vec<&'a str>,
    out: &mut Vec<String>,
) {
    if picked.len() == size {
        out.push(picked.join(" "));
        return;
    }
    let remaining = size - picked.len();
    for idx in start..=(words.len() - remaining) {
        picked.push(words[idx]);
        combine(words, size, idx + 1, picked, out);
        picked.pop();
    }
}
