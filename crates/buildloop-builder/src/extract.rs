use regex::Regex;
use std::sync::LazyLock;

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n?(.*?)```").expect("code block regex"));

/// What a model response decomposed into: clarifying questions and fenced
/// code blocks, in document order.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub questions: Vec<String>,
    pub code_blocks: Vec<String>,
}

impl ParsedResponse {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty() && self.code_blocks.is_empty()
    }
}

/// Split a model response into clarifying questions and code blocks.
///
/// A question is a line ending in `?` outside any fence; code blocks are the
/// bodies of triple-backtick fences, language tag stripped. Lines inside
/// fences never count as questions.
pub fn questions_and_code(response: &str) -> ParsedResponse {
    let mut code_blocks = Vec::new();
    for captures in CODE_BLOCK.captures_iter(response) {
        if let Some(body) = captures.get(1) {
            let trimmed = body.as_str().trim();
            if !trimmed.is_empty() {
                code_blocks.push(trimmed.to_string());
            }
        }
    }

    let without_code = CODE_BLOCK.replace_all(response, "");
    let questions = without_code
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.ends_with('?'))
        .map(ToString::to_string)
        .collect();

    ParsedResponse {
        questions,
        code_blocks,
    }
}
