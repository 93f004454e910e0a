//! Fractional indexing.
//!
//! Keys are base-62 strings made of an integer part and a fractional part.
//! The first character of the integer part encodes its length (`a`..`z` for
//! non-negative integers of 2..27 characters, `Z`..`A` for negative ones), so
//! that plain lexicographic byte comparison orders keys numerically. The
//! fractional part never ends in `0`, which keeps every key strictly between
//! its neighbours representable.
//!
//! Appending at either end increments or decrements the integer part, so keys
//! grow logarithmically under sorted inserts; inserting between two keys takes
//! the midpoint of their fractional parts.

use alloc::string::String;
use alloc::vec::Vec;
use rill_core::{Error, Result};

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ZERO: u8 = b'0';
const LAST_DIGIT: u8 = b'z';

/// The smallest integer part, `A` followed by 26 zeros. It cannot be decremented.
const SMALLEST_INTEGER_LEN: usize = 27;

fn digit_index(d: u8) -> Result<usize> {
    DIGITS
        .iter()
        .position(|&c| c == d)
        .ok_or_else(|| Error::invalid_order_key(alloc::format!("invalid digit {:?}", d as char)))
}

fn is_smallest_integer(int: &[u8]) -> bool {
    int.len() == SMALLEST_INTEGER_LEN && int[0] == b'A' && int[1..].iter().all(|&c| c == ZERO)
}

fn integer_length(head: u8) -> Result<usize> {
    match head {
        b'a'..=b'z' => Ok((head - b'a') as usize + 2),
        b'A'..=b'Z' => Ok((b'Z' - head) as usize + 2),
        _ => Err(Error::invalid_order_key(alloc::format!(
            "invalid integer head {:?}",
            head as char
        ))),
    }
}

fn integer_part(key: &[u8]) -> Result<&[u8]> {
    let head = *key
        .first()
        .ok_or_else(|| Error::invalid_order_key("empty key"))?;
    let len = integer_length(head)?;
    if len > key.len() {
        return Err(Error::invalid_order_key("integer part longer than key"));
    }
    Ok(&key[..len])
}

fn validate_key(key: &[u8]) -> Result<()> {
    if is_smallest_integer(key) {
        return Err(Error::invalid_order_key("key is the smallest integer"));
    }
    let int = integer_part(key)?;
    let frac = &key[int.len()..];
    if frac.last() == Some(&ZERO) {
        return Err(Error::invalid_order_key("fractional part ends with zero"));
    }
    for &d in key[1..].iter() {
        digit_index(d)?;
    }
    Ok(())
}

fn increment_integer(int: &[u8]) -> Result<Option<Vec<u8>>> {
    let head = int[0];
    let mut digs: Vec<u8> = int[1..].to_vec();
    let mut carry = true;
    for d in digs.iter_mut().rev() {
        if !carry {
            break;
        }
        let next = digit_index(*d)? + 1;
        if next == DIGITS.len() {
            *d = ZERO;
        } else {
            *d = DIGITS[next];
            carry = false;
        }
    }
    if !carry {
        let mut out = Vec::with_capacity(int.len());
        out.push(head);
        out.extend_from_slice(&digs);
        return Ok(Some(out));
    }
    match head {
        b'Z' => Ok(Some(alloc::vec![b'a', ZERO])),
        b'z' => Ok(None),
        _ => {
            let next_head = head + 1;
            if next_head > b'a' {
                digs.push(ZERO);
            } else {
                digs.pop();
            }
            let mut out = Vec::with_capacity(digs.len() + 1);
            out.push(next_head);
            out.extend_from_slice(&digs);
            Ok(Some(out))
        }
    }
}

fn decrement_integer(int: &[u8]) -> Result<Option<Vec<u8>>> {
    let head = int[0];
    let mut digs: Vec<u8> = int[1..].to_vec();
    let mut borrow = true;
    for d in digs.iter_mut().rev() {
        if !borrow {
            break;
        }
        let idx = digit_index(*d)?;
        if idx == 0 {
            *d = LAST_DIGIT;
        } else {
            *d = DIGITS[idx - 1];
            borrow = false;
        }
    }
    if !borrow {
        let mut out = Vec::with_capacity(int.len());
        out.push(head);
        out.extend_from_slice(&digs);
        return Ok(Some(out));
    }
    match head {
        b'a' => Ok(Some(alloc::vec![b'Z', LAST_DIGIT])),
        b'A' => Ok(None),
        _ => {
            let prev_head = head - 1;
            if prev_head < b'Z' {
                digs.push(LAST_DIGIT);
            } else {
                digs.pop();
            }
            let mut out = Vec::with_capacity(digs.len() + 1);
            out.push(prev_head);
            out.extend_from_slice(&digs);
            Ok(Some(out))
        }
    }
}

/// Midpoint of two fractional parts; `b == None` means "1.0".
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Result<Vec<u8>> {
    if let Some(b) = b {
        if a >= b {
            return Err(Error::invalid_order_key("midpoint bounds out of order"));
        }
        if b.last() == Some(&ZERO) {
            return Err(Error::invalid_order_key("fractional part ends with zero"));
        }
        // Shared prefix, treating a missing digit of `a` as zero.
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(ZERO) == b[n] {
            n += 1;
        }
        if n > 0 {
            let rest_a = if n < a.len() { &a[n..] } else { &[][..] };
            let mut out = b[..n].to_vec();
            out.extend(midpoint(rest_a, Some(&b[n..]))?);
            return Ok(out);
        }
    }
    if a.last() == Some(&ZERO) {
        return Err(Error::invalid_order_key("fractional part ends with zero"));
    }

    let digit_a = match a.first() {
        Some(&d) => digit_index(d)?,
        None => 0,
    };
    let digit_b = match b {
        Some(b) => digit_index(b[0])?,
        None => DIGITS.len(),
    };
    if digit_b - digit_a > 1 {
        // Round half up.
        let mid = (digit_a + digit_b + 1) / 2;
        return Ok(alloc::vec![DIGITS[mid]]);
    }
    match b {
        Some(b) if b.len() > 1 => Ok(alloc::vec![b[0]]),
        _ => {
            let rest_a = if a.len() > 1 { &a[1..] } else { &[][..] };
            let mut out = alloc::vec![DIGITS[digit_a]];
            out.extend(midpoint(rest_a, None)?);
            Ok(out)
        }
    }
}

fn to_string(bytes: Vec<u8>) -> String {
    // Every byte comes from DIGITS or the ASCII head range.
    bytes.into_iter().map(char::from).collect()
}

/// Generates a key strictly between `a` and `b`.
///
/// `None` for `a` means "before everything", `None` for `b` means "after
/// everything". Fails when `a >= b` or either key is malformed.
pub fn generate_key_between(a: Option<&str>, b: Option<&str>) -> Result<String> {
    let a = a.map(str::as_bytes);
    let b = b.map(str::as_bytes);
    if let Some(a) = a {
        validate_key(a)?;
    }
    if let Some(b) = b {
        validate_key(b)?;
    }

    match (a, b) {
        (None, None) => Ok(String::from("a0")),
        (None, Some(b)) => {
            let ib = integer_part(b)?;
            let fb = &b[ib.len()..];
            if is_smallest_integer(ib) {
                let mut out = ib.to_vec();
                out.extend(midpoint(&[], Some(fb))?);
                return Ok(to_string(out));
            }
            if ib.len() < b.len() {
                return Ok(to_string(ib.to_vec()));
            }
            match decrement_integer(ib)? {
                Some(res) => Ok(to_string(res)),
                None => Err(Error::invalid_order_key("cannot decrement any more")),
            }
        }
        (Some(a), None) => {
            let ia = integer_part(a)?;
            let fa = &a[ia.len()..];
            match increment_integer(ia)? {
                Some(res) => Ok(to_string(res)),
                None => {
                    let mut out = ia.to_vec();
                    out.extend(midpoint(fa, None)?);
                    Ok(to_string(out))
                }
            }
        }
        (Some(a), Some(b)) => {
            if a >= b {
                return Err(Error::invalid_order_key(alloc::format!(
                    "{} >= {}",
                    String::from_utf8_lossy(a),
                    String::from_utf8_lossy(b)
                )));
            }
            let ia = integer_part(a)?;
            let fa = &a[ia.len()..];
            let ib = integer_part(b)?;
            let fb = &b[ib.len()..];
            if ia == ib {
                let mut out = ia.to_vec();
                out.extend(midpoint(fa, Some(fb))?);
                return Ok(to_string(out));
            }
            let i = increment_integer(ia)?
                .ok_or_else(|| Error::invalid_order_key("cannot increment any more"))?;
            if i.as_slice() < b {
                return Ok(to_string(i));
            }
            let mut out = ia.to_vec();
            out.extend(midpoint(fa, None)?);
            Ok(to_string(out))
        }
    }
}
