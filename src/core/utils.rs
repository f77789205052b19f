//! Integer helpers and tensor-shape arithmetic shared by the scheduler.

use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Tensor shape in NHWC order.
pub type TensorShape = [u32; 4];

/// Divide rounding towards positive infinity.
pub const fn div_round_up(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

/// Round `value` up to the nearest multiple of `multiple`.
pub const fn round_up_to_multiple(value: u32, multiple: u32) -> u32 {
    div_round_up(value, multiple) * multiple
}

/// Number of elements in a shape.
pub fn total_size(shape: &TensorShape) -> u32 {
    shape.iter().product()
}

/// Round height and width up to the brick group, and channels for blocked layouts.
pub fn round_up_to_brick_group(shape: &TensorShape, brick_group: &TensorShape) -> TensorShape {
    [
        shape[0],
        round_up_to_multiple(shape[1], brick_group[1]),
        round_up_to_multiple(shape[2], brick_group[2]),
        round_up_to_multiple(shape[3], brick_group[3]),
    ]
}

/// Round only height and width up to the brick group.
pub fn round_up_height_and_width(shape: &TensorShape, brick_group: &TensorShape) -> TensorShape {
    [
        shape[0],
        round_up_to_multiple(shape[1], brick_group[1]),
        round_up_to_multiple(shape[2], brick_group[2]),
        shape[3],
    ]
}

/// A non-negative rational scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const ONE: Fraction = Fraction { numerator: 1, denominator: 1 };

    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }

    /// Scale `value`, truncating.
    pub fn apply(&self, value: u32) -> u32 {
        ((value as u64 * self.numerator as u64) / self.denominator as u64) as u32
    }

    /// Scale `value` by the inverse of this fraction, rounding up.
    pub fn apply_inverse(&self, value: u32) -> u32 {
        let scaled = value as u64 * self.denominator as u64;
        ((scaled + self.numerator as u64 - 1) / self.numerator as u64) as u32
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::ONE
    }
}

impl Mul for Fraction {
    type Output = Fraction;

    fn mul(self, rhs: Fraction) -> Fraction {
        let numerator = self.numerator * rhs.numerator;
        let denominator = self.denominator * rhs.denominator;
        let g = gcd(numerator, denominator).max(1);
        Fraction::new(numerator / g, denominator / g)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Spatial/channel up- or down-sampling introduced by an operation.
///
/// Output extent = input extent × multiplier, per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShapeMultiplier {
    #[serde(default)]
    pub height: Fraction,
    #[serde(default)]
    pub width: Fraction,
    #[serde(default)]
    pub channels: Fraction,
}

impl ShapeMultiplier {
    pub const IDENTITY: ShapeMultiplier = ShapeMultiplier {
        height: Fraction::ONE,
        width: Fraction::ONE,
        channels: Fraction::ONE,
    };

    pub const fn new(height: Fraction, width: Fraction, channels: Fraction) -> Self {
        Self { height, width, channels }
    }

    /// Input stripe extent needed to produce the given output stripe.
    pub fn input_for_output(&self, output: &TensorShape) -> TensorShape {
        [
            output[0],
            self.height.apply_inverse(output[1]),
            self.width.apply_inverse(output[2]),
            self.channels.apply_inverse(output[3]),
        ]
    }
}

impl Mul for ShapeMultiplier {
    type Output = ShapeMultiplier;

    fn mul(self, rhs: ShapeMultiplier) -> ShapeMultiplier {
        ShapeMultiplier {
            height: self.height * rhs.height,
            width: self.width * rhs.width,
            channels: self.channels * rhs.channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_helpers() {
        assert_eq!(div_round_up(17, 8), 3);
        assert_eq!(div_round_up(16, 8), 2);
        assert_eq!(round_up_to_multiple(5, 3), 6);
        assert_eq!(round_up_to_multiple(9, 3), 9);
    }

    #[test]
    fn test_shape_multiplier_composition() {
        let upscale = ShapeMultiplier::new(Fraction::new(2, 1), Fraction::new(2, 1), Fraction::ONE);
        let pool = ShapeMultiplier::new(Fraction::new(1, 2), Fraction::new(1, 2), Fraction::ONE);
        assert_eq!(upscale * pool, ShapeMultiplier::IDENTITY);

        let input = pool.input_for_output(&[1, 8, 8, 16]);
        assert_eq!(input, [1, 16, 16, 16]);
    }

    #[test]
    fn test_brick_group_rounding() {
        let brick = [1, 8, 8, 16];
        assert_eq!(round_up_to_brick_group(&[1, 17, 9, 3], &brick), [1, 24, 16, 16]);
        assert_eq!(round_up_height_and_width(&[1, 17, 9, 3], &brick), [1, 24, 16, 3]);
    }
}
