// platform/host/compile.rs — source validation for the host device.
//
// The host device cannot execute WGSL or OpenCL C; its kernels are native
// functions. "Compiling" a program therefore means checking that the text
// is structurally sound and collecting the entry points it declares, so the
// same source file fails or succeeds the same way on both platforms as far
// as structure and entry-point names go.
//
// Recognised entry points:
//   @compute ... fn NAME(       (WGSL, attributes may sit in between)
//   kernel void NAME(           (OpenCL C, also `__kernel`)

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Attr(String),
    Punct(char),
}

/// Scan `source` and return its entry-point names in declaration order.
pub(crate) fn entry_points(source: &str) -> Result<Vec<String>> {
    let tokens = tokenize(source)?;

    let mut entries = Vec::new();
    let mut compute_pending = false;
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Attr(a) if a == "compute" => compute_pending = true,
            Token::Ident(k) if k == "fn" && compute_pending => {
                if let Some(Token::Ident(name)) = tokens.get(i + 1) {
                    entries.push(name.clone());
                    i += 1;
                }
                compute_pending = false;
            }
            Token::Ident(k) if k == "kernel" || k == "__kernel" => {
                if let (Some(Token::Ident(ret)), Some(Token::Ident(name))) =
                    (tokens.get(i + 1), tokens.get(i + 2))
                {
                    if ret == "void" {
                        entries.push(name.clone());
                        i += 2;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    if entries.is_empty() {
        return Err(Error::Compile {
            log: "no kernel entry points declared".into(),
        });
    }
    Ok(entries)
}

/// Split source into identifiers, `@attributes` and punctuation, skipping
/// comments, literals' digits and whitespace. Delimiters must balance.
fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut open: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;

    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::Compile {
                                log: format!("line {start}: unterminated block comment"),
                            })
                        }
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => {
                            line += 1;
                            i += 1;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            '@' => {
                i += 1;
                let word = take_word(&chars, &mut i);
                if word.is_empty() {
                    return Err(Error::Compile {
                        log: format!("line {line}: `@` without attribute name"),
                    });
                }
                tokens.push(Token::Attr(word));
            }
            '(' | '{' | '[' => {
                open.push((c, line));
                tokens.push(Token::Punct(c));
                i += 1;
            }
            ')' | '}' | ']' => {
                let want = match c {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match open.pop() {
                    Some((o, _)) if o == want => {}
                    Some((o, at)) => {
                        return Err(Error::Compile {
                            log: format!("line {line}: `{c}` closes `{o}` opened on line {at}"),
                        })
                    }
                    None => {
                        return Err(Error::Compile {
                            log: format!("line {line}: unmatched `{c}`"),
                        })
                    }
                }
                tokens.push(Token::Punct(c));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                tokens.push(Token::Ident(take_word(&chars, &mut i)));
            }
            c if c.is_ascii_digit() => {
                // Numeric literal, including suffixes like `3u` or `1.0f`.
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
            }
            c if c.is_whitespace() => i += 1,
            c => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }

    if let Some((o, at)) = open.pop() {
        return Err(Error::Compile {
            log: format!("line {at}: `{o}` is never closed"),
        });
    }
    Ok(tokens)
}

fn take_word(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_ascii_alphanumeric() || chars[*i] == '_') {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgsl_entry_points() {
        let src = r#"
            @group(0) @binding(0) var<storage, read_write> data: array<i32>;

            fn helper(x: i32) -> i32 { return x + 1; }

            @compute @workgroup_size(8, 8, 1)
            fn first(@builtin(global_invocation_id) gid: vec3<u32>) {
                data[gid.x] = helper(data[gid.x]);
            }

            // @compute fn commented_out() {}
            @compute @workgroup_size(64)
            fn second() {}
        "#;
        assert_eq!(entry_points(src).unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_opencl_entry_points() {
        let src = "/* header */\n__kernel void a(global int * x) { x[0] = 1; }\n\
                   kernel void b(global int * x) { }\n";
        assert_eq!(entry_points(src).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unbalanced_source_reports_line() {
        let src = "@compute @workgroup_size(1)\nfn main() {\n  let x = (1 + 2;\n}\n";
        let err = entry_points(src).unwrap_err();
        match err {
            Error::Compile { log } => assert!(log.starts_with("line 4"), "{log}"),
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn test_source_without_kernels_is_rejected() {
        assert!(matches!(
            entry_points("fn helper() {}"),
            Err(Error::Compile { .. })
        ));
        assert!(matches!(entry_points(""), Err(Error::Compile { .. })));
    }

    #[test]
    fn test_unterminated_comment() {
        assert!(matches!(
            entry_points("kernel void a() {} /* oops"),
            Err(Error::Compile { .. })
        ));
    }
}
