//! Quoted option string splitting for transport command lines

use crate::error::{ArchiveError, Result};

/// Upper bound on the transport argument vector
pub const MAX_CMDLINE_OPTIONS: usize = 256;

/// Split `options` into tokens and append them to `args`.
///
/// Tokens are separated by whitespace. `'...'` and `"..."` group text that
/// contains whitespace; the quotes themselves are dropped. Inside a quoted
/// group a doubled quote character stands for one literal quote, so
/// `"d""e"` yields `d"e`. Fails when `args` would reach `max` entries or
/// when a quote is left open.
pub fn split_options(args: &mut Vec<String>, options: &str, max: usize) -> Result<()> {
    let mut chars = options.chars().peekable();
    let mut token = String::new();
    // Set once a token has started, so `''` still yields an empty argument
    let mut pending = false;
    let mut in_quote: Option<char> = None;

    let push = |args: &mut Vec<String>, token: &mut String| -> Result<()> {
        args.push(std::mem::take(token));
        if args.len() >= max {
            return Err(ArchiveError::TooManyOptions { limit: max });
        }
        Ok(())
    };

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                    token.push(q);
                } else {
                    in_quote = None;
                }
            }
            Some(_) => token.push(c),
            None if c == '\'' || c == '"' => {
                in_quote = Some(c);
                pending = true;
            }
            None if c.is_whitespace() => {
                if pending {
                    push(args, &mut token)?;
                    pending = false;
                }
            }
            None => {
                token.push(c);
                pending = true;
            }
        }
    }

    if let Some(quote) = in_quote {
        return Err(ArchiveError::UnterminatedQuote { quote });
    }
    if pending {
        push(args, &mut token)?;
    }
    Ok(())
}

/// Tokenize a standalone option string
pub fn tokenize(options: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    split_options(&mut args, options, MAX_CMDLINE_OPTIONS)?;
    Ok(args)
}
