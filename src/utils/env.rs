/// Parses a size such as `512`, `64k`, `8m` or `1g` (an optional trailing
/// `b` is ignored).
pub fn read_uint_from_str(value: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor(value)?;
    Some(value as usize * factor)
}

fn read_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let factor = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => 1024 * 1024 * 1024,
        b'm' | b'M' => 1024 * 1024,
        b'k' | b'K' => 1024,
        _ => 1,
    };
    let digits = if factor == 1 {
        value
    } else {
        &value[..value.len() - 1]
    };

    digits.parse::<f64>().ok().map(|x| (x, factor))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    read_uint_from_str(&std::env::var(var).ok()?)
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match std::env::var(var).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(read_uint_from_str("512"), Some(512));
        assert_eq!(read_uint_from_str("4k"), Some(4096));
        assert_eq!(read_uint_from_str("2MB"), Some(2 * 1024 * 1024));
        assert_eq!(read_uint_from_str("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(read_uint_from_str(""), None);
        assert_eq!(read_uint_from_str("lots"), None);
    }
}
