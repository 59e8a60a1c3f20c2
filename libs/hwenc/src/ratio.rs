// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

/// Largest numerator or denominator accepted for a display aspect ratio.
pub const MAX_ASPECT_TERM: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rational {
    pub num: u64,
    pub den: u64,
}

impl Rational {
    pub const fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Reduces `num / den` to the closest fraction whose terms do not exceed
/// `max`, walking the continued fraction expansion.
pub fn reduce(num: u64, den: u64, max: u64) -> Rational {
    let g = gcd(num, den);
    let (mut num, mut den) = if g > 0 { (num / g, den / g) } else { (num, den) };

    let mut a0 = Rational::new(0, 1);
    let mut a1 = Rational::new(1, 0);

    if num <= max && den <= max {
        return Rational::new(num, den);
    }

    while den != 0 {
        let x = num / den;
        let next_den = num - den * x;
        let a2 = Rational::new(
            x.saturating_mul(a1.num).saturating_add(a0.num),
            x.saturating_mul(a1.den).saturating_add(a0.den),
        );

        if a2.num > max || a2.den > max {
            let mut x = u64::MAX;
            if a1.num != 0 {
                x = (max - a0.num) / a1.num;
            }
            if a1.den != 0 {
                x = x.min((max - a0.den) / a1.den);
            }
            // Take the semiconvergent only when it beats the last convergent.
            if (den as u128) * (2 * x as u128 * a1.den as u128 + a0.den as u128)
                > (num as u128) * (a1.den as u128)
            {
                a1 = Rational::new(x * a1.num + a0.num, x * a1.den + a0.den);
            }
            break;
        }

        a0 = a1;
        a1 = a2;
        num = den;
        den = next_den;
    }

    a1
}

/// Display aspect ratio of a `width` x `height` picture with the given
/// sample aspect ratio. A zero SAR term means square pixels.
pub fn display_aspect(width: u32, height: u32, sar_num: u32, sar_den: u32) -> Rational {
    let (sn, sd) = if sar_num == 0 || sar_den == 0 {
        (1, 1)
    } else {
        (sar_num as u64, sar_den as u64)
    };
    reduce(width as u64 * sn, height as u64 * sd, MAX_ASPECT_TERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_reduction() {
        assert_eq!(reduce(1920, 1080, MAX_ASPECT_TERM), Rational::new(16, 9));
        assert_eq!(reduce(720 * 64, 576 * 45, MAX_ASPECT_TERM), Rational::new(16, 9));
    }

    #[test]
    fn test_approximation_respects_bound() {
        let r = reduce(314_159_265, 100_000_000, 1000);
        assert!(r.num <= 1000 && r.den <= 1000);
        assert_eq!(r, Rational::new(355, 113));
    }

    #[test]
    fn test_display_aspect() {
        assert_eq!(display_aspect(1280, 720, 0, 0), Rational::new(16, 9));
        assert_eq!(display_aspect(720, 480, 32, 27), Rational::new(16, 9));
        assert_eq!(display_aspect(720, 480, 8, 9), Rational::new(4, 3));
    }
}
