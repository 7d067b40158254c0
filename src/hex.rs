use core::fmt;

/// Lowercase hex rendering of a byte slice, optionally truncated.
pub struct Hex<'a> {
    bytes: &'a [u8],
    limit: Option<usize>,
}

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = match self.limit {
            Some(limit) => &self.bytes[..limit.min(self.bytes.len())],
            None => self.bytes,
        };
        for byte in shown {
            write!(f, "{:02x}", byte)?;
        }
        if shown.len() < self.bytes.len() {
            f.write_str("..")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Hex display for node ids, keys and round ids in log lines.
pub trait HexExt {
    fn hex(&self) -> Hex<'_>;
    /// The first four bytes, enough to tell nodes apart in a log.
    fn short_hex(&self) -> Hex<'_>;
}

impl<T> HexExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> Hex<'_> {
        Hex {
            bytes: self.as_ref(),
            limit: None,
        }
    }

    fn short_hex(&self) -> Hex<'_> {
        Hex {
            bytes: self.as_ref(),
            limit: Some(4),
        }
    }
}
