//! Interpretation of one assistant turn inside the reasoning loop.

/// What the assistant asked for in its latest reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run this python code against the dataset and report back.
    RunCode(String),
    /// Explicit `FINAL(...)` answer.
    Final(String),
    /// Plain reply without a tool call; the loop treats it as the answer.
    Respond,
}

impl Action {
    /// `FINAL(...)` wins over code so an answer that quotes code still terminates.
    pub fn parse(reply: &str) -> Self {
        if let Some(answer) = final_answer(reply) {
            return Action::Final(answer);
        }
        if let Some(code) = fenced_code(reply) {
            return Action::RunCode(code);
        }
        Action::Respond
    }
}

fn final_answer(reply: &str) -> Option<String> {
    let start = reply.find("FINAL(")? + "FINAL(".len();
    let body = &reply[start..];
    let mut depth = 1usize;
    let mut end = body.len();
    for (idx, ch) in body.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = idx;
                    break;
                }
            }
            _ => {}
        }
    }
    let answer = body[..end].trim();
    let answer = ['"', '\'']
        .iter()
        .find_map(|q| {
            answer
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(answer);
    Some(answer.trim().to_string())
}

fn fenced_code(reply: &str) -> Option<String> {
    let (open, tag_len) = ["```python", "```py", "```repl"]
        .iter()
        .filter_map(|tag| reply.find(tag).map(|idx| (idx, tag.len())))
        .min_by_key(|(idx, _)| *idx)?;
    let after_tag = &reply[open + tag_len..];
    let body_start = after_tag.find('\n').map(|idx| idx + 1).unwrap_or(after_tag.len());
    let body = &after_tag[body_start..];
    let body_end = body.find("```").unwrap_or(body.len());
    let code = body[..body_end].trim();
    (!code.is_empty()).then(|| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_block() {
        let reply = "Let me count rows.\n```python\nimport pandas as pd\nprint(len(df))\n```\n";
        assert_eq!(
            Action::parse(reply),
            Action::RunCode("import pandas as pd\nprint(len(df))".to_string())
        );
    }

    #[test]
    fn final_marker_handles_nested_parens() {
        let reply = "FINAL(\"Verified (3 uploads found in March)\")";
        assert_eq!(
            Action::parse(reply),
            Action::Final("Verified (3 uploads found in March)".to_string())
        );
    }

    #[test]
    fn final_beats_code() {
        let reply = "```python\nprint(1)\n```\nFINAL(done)";
        assert_eq!(Action::parse(reply), Action::Final("done".to_string()));
    }

    #[test]
    fn prose_and_empty_blocks_are_plain_replies() {
        assert_eq!(Action::parse("The claim holds."), Action::Respond);
        assert_eq!(Action::parse("```python\n\n```"), Action::Respond);
    }
}
