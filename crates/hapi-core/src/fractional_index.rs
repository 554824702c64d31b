//! Fractional-indexing key generation for client-ordered lists
//! (`Session::sort_order`, `Team::sort_order`).
//!
//! Keys are base-62 strings (`0-9A-Za-z`) that compare with ordinary
//! string ordering. Given any two adjacent keys, [`key_between`]
//! produces a new key that sorts strictly between them without
//! re-keying either neighbor, so insertion is O(1) regardless of list
//! size.

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u32 = 62;
const MID: u8 = (BASE / 2) as u8;

fn digit_value(c: u8) -> u32 {
    DIGITS.iter().position(|&d| d == c).expect("valid fractional-index digit") as u32
}

fn digit_char(v: u32) -> u8 {
    DIGITS[v as usize]
}

/// Generate a key that sorts strictly between `lower` and `upper`.
///
/// `lower = None` means "before every existing key" (used when a new
/// session should sort at the top of its namespace); `upper = None`
/// means "after every existing key". Passing both `None` returns the
/// midpoint key used to seed an empty list.
pub fn key_between(lower: Option<&str>, upper: Option<&str>) -> String {
    match (lower, upper) {
        (None, None) => String::from_utf8(vec![digit_char(MID as u32)]).unwrap(),
        (None, Some(upper)) => before(upper),
        (Some(lower), None) => after(lower),
        (Some(lower), Some(upper)) => between(lower, upper),
    }
}

fn before(upper: &str) -> String {
    let bytes = upper.as_bytes();
    let first = digit_value(bytes[0]);
    if first > 0 {
        let mut out = vec![digit_char(first / 2)];
        if first / 2 == first && first > 0 {
            out.push(digit_char(MID as u32));
        }
        return String::from_utf8(out).unwrap();
    }
    // upper starts at '0': prepend a midpoint digit before the whole key.
    let mut out = vec![digit_char(0), digit_char(MID as u32)];
    out.extend_from_slice(bytes);
    String::from_utf8(out).unwrap()
}

fn after(lower: &str) -> String {
    let bytes = lower.as_bytes();
    let last = digit_value(bytes[bytes.len() - 1]);
    if last < BASE - 1 {
        let mut out = bytes[..bytes.len() - 1].to_vec();
        out.push(digit_char(last + (BASE - last) / 2));
        return String::from_utf8(out).unwrap();
    }
    let mut out = bytes.to_vec();
    out.push(digit_char(MID as u32));
    String::from_utf8(out).unwrap()
}

fn between(lower: &str, upper: &str) -> String {
    let l = lower.as_bytes();
    let u = upper.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let lv = l.get(i).map(|&c| digit_value(c)).unwrap_or(0);
        let uv = u.get(i).copied().map(digit_value);
        match uv {
            Some(uv) if uv == lv => {
                out.push(digit_char(lv));
                i += 1;
                continue;
            }
            Some(uv) => {
                if uv > lv + 1 {
                    out.push(digit_char(lv + (uv - lv) / 2));
                    return String::from_utf8(out).unwrap();
                }
                // uv == lv + 1: keep `lv` and recurse into lower's
                // remaining tail to split against an implicit "end".
                out.push(digit_char(lv));
                i += 1;
                let rest_lower = if i < l.len() {
                    Some(std::str::from_utf8(&l[i..]).unwrap())
                } else {
                    None
                };
                let generated = after_tail(rest_lower);
                out.extend_from_slice(generated.as_bytes());
                return String::from_utf8(out).unwrap();
            }
            None => {
                // upper exhausted at this position; lower still has
                // more digits, so append a midpoint digit after lv.
                out.push(digit_char(lv));
                if lv < BASE - 1 {
                    out.push(digit_char(lv + (BASE - lv) / 2));
                } else {
                    out.push(digit_char(MID as u32));
                }
                return String::from_utf8(out).unwrap();
            }
        }
    }
}

fn after_tail(rest_lower: Option<&str>) -> String {
    match rest_lower {
        None => String::from_utf8(vec![digit_char(MID as u32)]).unwrap(),
        Some(rest) => after(rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_all_sorts_before_existing_top() {
        let top = key_between(None, None);
        let new_top = key_between(None, Some(&top));
        assert!(new_top < top, "{new_top} should sort before {top}");
    }

    #[test]
    fn after_all_sorts_after_existing_bottom() {
        let bottom = key_between(None, None);
        let new_bottom = key_between(Some(&bottom), None);
        assert!(new_bottom > bottom, "{new_bottom} should sort after {bottom}");
    }

    #[test]
    fn between_two_adjacent_keys_sorts_strictly_between() {
        let a = key_between(None, None);
        let b = key_between(Some(&a), None);
        let mid = key_between(Some(&a), Some(&b));
        assert!(a < mid && mid < b, "{a} < {mid} < {b}");
    }

    #[test]
    fn repeated_insertion_at_same_point_never_collides() {
        let a = key_between(None, None);
        let b = key_between(Some(&a), None);
        let mut lo = a.clone();
        let mut hi = b.clone();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let mid = key_between(Some(&lo), Some(&hi));
            assert!(lo < mid && mid < hi, "{lo} < {mid} < {hi}");
            assert!(seen.insert(mid.clone()), "collided on {mid}");
            hi = mid;
        }
        let _ = &mut lo;
    }

    #[test]
    fn new_session_sorts_before_all_existing_in_namespace() {
        let first = key_between(None, None);
        let second = key_between(None, Some(&first));
        let third = key_between(None, Some(&second));
        assert!(third < second && second < first);
    }
}
