//! Splitting raw migration scripts into individual statements

#[derive(Clone, Copy, PartialEq)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// Splits `script` on `;`, dropping `--` and `/* */` comments and blank statements.
///
/// Delimiters and comment markers inside quoted strings or identifiers are kept.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                ';' => push_statement(&mut statements, &mut current),
                '\'' => {
                    current.push(c);
                    state = State::SingleQuoted;
                }
                '"' => {
                    current.push(c);
                    state = State::DoubleQuoted;
                }
                _ => current.push(c),
            },
            State::SingleQuoted => {
                current.push(c);
                // A doubled quote is an escaped quote and keeps us inside the literal.
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        current.push('\'');
                        chars.next();
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                current.push(c);
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push(' ');
                    state = State::Normal;
                }
            }
        }
    }

    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_strips_comments() {
        let script = r#"
-- Add power state tracking
ALTER TABLE Asset ADD COLUMN powerState TEXT DEFAULT 'on';

/* indexes
   for dashboards */
CREATE INDEX IF NOT EXISTS idx_asset_power ON Asset(powerState); -- trailing
"#;
        let statements = split_statements(script);
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE Asset ADD COLUMN powerState TEXT DEFAULT 'on'",
                "CREATE INDEX IF NOT EXISTS idx_asset_power ON Asset(powerState)",
            ]
        );
    }

    #[test]
    fn test_delimiters_inside_quotes_are_kept() {
        let statements = split_statements("INSERT INTO Note(body) VALUES ('a;b -- not a comment'); UPDATE Note SET body = 'it''s;'");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO Note(body) VALUES ('a;b -- not a comment')");
        assert_eq!(statements[1], "UPDATE Note SET body = 'it''s;'");
    }

    #[test]
    fn test_blank_and_comment_only_scripts() {
        assert!(split_statements("  ;; -- nothing here\n ; /* nor here */").is_empty());
    }
}
