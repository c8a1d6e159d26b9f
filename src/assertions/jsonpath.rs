// Minimal JSONPath evaluation: root, dot fields, bracket keys, numeric
// indices (negative from the end), and [*] over arrays.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
    Wild,
}

/// Evaluate `path` against `value`, e.g. `$.items[0].id`.
pub(crate) fn eval(path: &str, value: &Value) -> Result<Value, String> {
    let segments = parse(path)?;
    walk(value, &segments)
}

fn parse(path: &str) -> Result<Vec<Segment>, String> {
    let trimmed = path.trim();
    let rest = trimmed
        .strip_prefix('$')
        .ok_or_else(|| format!("path must start with '$': '{path}'"))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                if name.is_empty() {
                    return Err(format!("empty field name in '{path}'"));
                }
                segments.push(Segment::Key(name));
            }
            '[' => {
                let mut inner = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next);
                }
                if !closed {
                    return Err(format!("unclosed '[' in '{path}'"));
                }
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wild);
                } else if (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
                    || (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
                {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index: i64 = inner
                        .parse()
                        .map_err(|_| format!("bad index '{inner}' in '{path}'"))?;
                    segments.push(Segment::Index(index));
                }
            }
            other => return Err(format!("unexpected '{other}' in '{path}'")),
        }
    }

    Ok(segments)
}

fn walk(value: &Value, segments: &[Segment]) -> Result<Value, String> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(value.clone());
    };

    match first {
        Segment::Key(key) => match value.get(key) {
            Some(inner) => walk(inner, rest),
            None => Err(format!("no field '{key}'")),
        },
        Segment::Index(index) => {
            let array = value.as_array().ok_or("not an array")?;
            let len = array.len() as i64;
            let resolved = if *index < 0 { len + index } else { *index };
            if resolved < 0 || resolved >= len {
                return Err(format!("index {index} out of bounds (len {len})"));
            }
            walk(&array[resolved as usize], rest)
        }
        Segment::Wild => {
            let array = value.as_array().ok_or("[*] applied to a non-array")?;
            let collected: Result<Vec<Value>, String> =
                array.iter().map(|item| walk(item, rest)).collect();
            Ok(Value::Array(collected?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "items": [
                {"id": 42, "tags": ["a", "b"]},
                {"id": 43, "tags": ["c"]}
            ],
            "meta": {"total": 2, "page.size": 10}
        })
    }

    #[test]
    fn test_root() {
        assert_eq!(eval("$", &doc()).unwrap(), doc());
    }

    #[test]
    fn test_dot_fields() {
        assert_eq!(eval("$.meta.total", &doc()).unwrap(), json!(2));
    }

    #[test]
    fn test_array_index() {
        assert_eq!(eval("$.items[0].id", &doc()).unwrap(), json!(42));
        assert_eq!(eval("$.items[1].id", &doc()).unwrap(), json!(43));
    }

    #[test]
    fn test_negative_index() {
        assert_eq!(eval("$.items[-1].id", &doc()).unwrap(), json!(43));
    }

    #[test]
    fn test_bracket_key() {
        assert_eq!(eval("$.meta['page.size']", &doc()).unwrap(), json!(10));
        assert_eq!(eval("$[\"meta\"].total", &doc()).unwrap(), json!(2));
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(eval("$.items[*].id", &doc()).unwrap(), json!([42, 43]));
    }

    #[test]
    fn test_missing_field() {
        assert!(eval("$.nothing", &doc()).is_err());
        assert!(eval("$.items[5]", &doc()).is_err());
    }

    #[test]
    fn test_bad_paths() {
        assert!(eval("items.id", &doc()).is_err());
        assert!(eval("$.items[", &doc()).is_err());
        assert!(eval("$.items[x]", &doc()).is_err());
        assert!(eval("$.", &doc()).is_err());
    }

    #[test]
    fn test_index_on_non_array() {
        assert!(eval("$.meta[0]", &doc()).is_err());
    }
}
