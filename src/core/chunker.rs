/// Counts tokens for a piece of text. Implementations may be approximate.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Roughly four characters per token, rounded up so that per-line counts
/// never sum to less than the count of the joined text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Split `text` at line boundaries into chunks of at most `max_tokens` each.
///
/// Lines keep their terminators, so concatenating the chunks reproduces the
/// input exactly. A single line over budget becomes its own chunk.
pub fn chunk_by_tokens(text: &str, counter: &dyn TokenCounter, max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for line in text.split_inclusive('\n') {
        let line_tokens = counter.count(line);
        if current_tokens + line_tokens > max_tokens {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.push_str(line);
            current_tokens = line_tokens;
        } else {
            current.push_str(line);
            current_tokens += line_tokens;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
