//! Types for representing image resolutions.

use std::{fmt, str::FromStr};

/// Resolution (`width x height`) of an image or camera.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// 720p resolution: `1280x720`
    pub const RES_720P: Self = Self {
        width: 1280,
        height: 720,
    };

    /// VGA resolution: `640x480`
    pub const VGA: Self = Self {
        width: 640,
        height: 480,
    };

    /// Creates a new [`Resolution`] of `width x height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the width of this [`Resolution`].
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of this [`Resolution`].
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parses resolutions in `WIDTHxHEIGHT` notation, eg. `1280x720`.
impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((w, h)) = s.split_once(&['x', 'X'][..]) else {
            return Err(format!("invalid resolution '{s}', expected WIDTHxHEIGHT"));
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid resolution '{s}': {e}"))
        };
        Ok(Self::new(parse(w)?, parse(h)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("1280x720".parse::<Resolution>(), Ok(Resolution::RES_720P));
        assert_eq!("640X480".parse::<Resolution>(), Ok(Resolution::VGA));
        assert!("640".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn display() {
        assert_eq!(Resolution::VGA.to_string(), "640x480");
        assert_eq!(Resolution::VGA.num_pixels(), 307_200);
    }
}
