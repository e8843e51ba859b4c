//! Forward-mode automatic differentiation scalar.
//!
//! A `Dual<N>` carries a value together with up to `N` partial derivatives.
//! The capacity `N` is fixed at compile time; callers seed a derivative slot
//! before an evaluation pass and read the propagated partials back with
//! [`Dual::dx`]. Unseeded slots stay zero, so an evaluation over a mix of
//! seeded and constant operands yields exactly the partials of the seeded
//! inputs.
//!
//! The type is `Copy` and all arithmetic is slot-wise, which keeps the hot
//! assembly loops free of allocation.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Dual number with value and `N` derivative slots.
#[derive(Clone, Copy)]
pub struct Dual<const N: usize> {
    val: f64,
    dx: [f64; N],
}

impl<const N: usize> Dual<N> {
    /// A constant: value with all derivative slots zero.
    #[inline]
    pub fn constant(val: f64) -> Self {
        Self { val, dx: [0.0; N] }
    }

    /// A value seeded as the independent variable in `slot`.
    ///
    /// # Panics
    /// Panics if `slot >= N`; capacity checks belong to the caller
    /// (the assembler verifies the slot budget at cell registration).
    #[inline]
    pub fn seeded(val: f64, slot: usize) -> Self {
        let mut dx = [0.0; N];
        dx[slot] = 1.0;
        Self { val, dx }
    }

    /// A value whose derivative in `slot` is `scale` (chain-rule seeding,
    /// e.g. du̇/du = α for implicit time stepping).
    #[inline]
    pub fn seeded_scaled(val: f64, slot: usize, scale: f64) -> Self {
        let mut dx = [0.0; N];
        dx[slot] = scale;
        Self { val, dx }
    }

    /// The scalar value.
    #[inline]
    pub fn val(&self) -> f64 {
        self.val
    }

    /// The partial derivative in `slot`.
    #[inline]
    pub fn dx(&self, slot: usize) -> f64 {
        self.dx[slot]
    }

    /// Overwrite the partial derivative in `slot` (used when derivatives
    /// are supplied by an external linear solve rather than propagation).
    #[inline]
    pub fn set_dx(&mut self, slot: usize, v: f64) {
        self.dx[slot] = v;
    }

    /// All derivative slots.
    #[inline]
    pub fn derivs(&self) -> &[f64; N] {
        &self.dx
    }

    /// Number of derivative slots.
    pub const fn capacity() -> usize {
        N
    }

    #[inline]
    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    /// Apply the chain rule for a scalar function with value `f` and
    /// derivative `df` at `self.val`.
    #[inline]
    fn chain(&self, f: f64, df: f64) -> Self {
        let mut dx = [0.0; N];
        for i in 0..N {
            dx[i] = df * self.dx[i];
        }
        Self { val: f, dx }
    }

    pub fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    pub fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    pub fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }

    pub fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }

    pub fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }

    pub fn tan(self) -> Self {
        let c = self.val.cos();
        self.chain(self.val.tan(), 1.0 / (c * c))
    }

    pub fn abs(self) -> Self {
        if self.val < 0.0 { -self } else { self }
    }

    pub fn powi(self, n: i32) -> Self {
        self.chain(
            self.val.powi(n),
            f64::from(n) * self.val.powi(n - 1),
        )
    }

    pub fn powf(self, p: f64) -> Self {
        self.chain(self.val.powf(p), p * self.val.powf(p - 1.0))
    }

    /// Exponentiation with a dual exponent: a^b = exp(b ln a).
    pub fn pow(self, other: Self) -> Self {
        (other * self.ln()).exp()
    }

    /// The larger operand by value.
    pub fn max(self, other: Self) -> Self {
        if self.val >= other.val { self } else { other }
    }

    /// The smaller operand by value.
    pub fn min(self, other: Self) -> Self {
        if self.val <= other.val { self } else { other }
    }
}

impl<const N: usize> Default for Dual<N> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<const N: usize> fmt::Debug for Dual<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dual({}", self.val)?;
        for (i, d) in self.dx.iter().enumerate() {
            if *d != 0.0 {
                write!(f, "; d{}={}", i, d)?;
            }
        }
        write!(f, ")")
    }
}

impl<const N: usize> From<f64> for Dual<N> {
    fn from(val: f64) -> Self {
        Self::constant(val)
    }
}

impl<const N: usize> PartialEq for Dual<N> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<const N: usize> PartialOrd for Dual<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.val.partial_cmp(&other.val)
    }
}

impl<const N: usize> Neg for Dual<N> {
    type Output = Self;
    #[inline]
    fn neg(mut self) -> Self {
        self.val = -self.val;
        for i in 0..N {
            self.dx[i] = -self.dx[i];
        }
        self
    }
}

impl<const N: usize> Add for Dual<N> {
    type Output = Self;
    #[inline]
    fn add(mut self, rhs: Self) -> Self {
        self.val += rhs.val;
        for i in 0..N {
            self.dx[i] += rhs.dx[i];
        }
        self
    }
}

impl<const N: usize> Sub for Dual<N> {
    type Output = Self;
    #[inline]
    fn sub(mut self, rhs: Self) -> Self {
        self.val -= rhs.val;
        for i in 0..N {
            self.dx[i] -= rhs.dx[i];
        }
        self
    }
}

impl<const N: usize> Mul for Dual<N> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        let mut dx = [0.0; N];
        for i in 0..N {
            dx[i] = self.dx[i] * rhs.val + self.val * rhs.dx[i];
        }
        Self {
            val: self.val * rhs.val,
            dx,
        }
    }
}

impl<const N: usize> Div for Dual<N> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = 1.0 / rhs.val;
        let mut dx = [0.0; N];
        for i in 0..N {
            dx[i] = (self.dx[i] - self.val * inv * rhs.dx[i]) * inv;
        }
        Self {
            val: self.val * inv,
            dx,
        }
    }
}

impl<const N: usize> Add<f64> for Dual<N> {
    type Output = Self;
    #[inline]
    fn add(mut self, rhs: f64) -> Self {
        self.val += rhs;
        self
    }
}

impl<const N: usize> Sub<f64> for Dual<N> {
    type Output = Self;
    #[inline]
    fn sub(mut self, rhs: f64) -> Self {
        self.val -= rhs;
        self
    }
}

impl<const N: usize> Mul<f64> for Dual<N> {
    type Output = Self;
    #[inline]
    fn mul(mut self, rhs: f64) -> Self {
        self.val *= rhs;
        for i in 0..N {
            self.dx[i] *= rhs;
        }
        self
    }
}

impl<const N: usize> Div<f64> for Dual<N> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: f64) -> Self {
        self * (1.0 / rhs)
    }
}

impl<const N: usize> Add<Dual<N>> for f64 {
    type Output = Dual<N>;
    #[inline]
    fn add(self, rhs: Dual<N>) -> Dual<N> {
        rhs + self
    }
}

impl<const N: usize> Sub<Dual<N>> for f64 {
    type Output = Dual<N>;
    #[inline]
    fn sub(self, rhs: Dual<N>) -> Dual<N> {
        -rhs + self
    }
}

impl<const N: usize> Mul<Dual<N>> for f64 {
    type Output = Dual<N>;
    #[inline]
    fn mul(self, rhs: Dual<N>) -> Dual<N> {
        rhs * self
    }
}

impl<const N: usize> Div<Dual<N>> for f64 {
    type Output = Dual<N>;
    #[inline]
    fn div(self, rhs: Dual<N>) -> Dual<N> {
        Dual::constant(self) / rhs
    }
}

impl<const N: usize> AddAssign for Dual<N> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<const N: usize> SubAssign for Dual<N> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<const N: usize> MulAssign for Dual<N> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<const N: usize> DivAssign for Dual<N> {
    #[inline]
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

impl<const N: usize> AddAssign<f64> for Dual<N> {
    #[inline]
    fn add_assign(&mut self, rhs: f64) {
        self.val += rhs;
    }
}

impl<const N: usize> MulAssign<f64> for Dual<N> {
    #[inline]
    fn mul_assign(&mut self, rhs: f64) {
        *self = *self * rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type D4 = Dual<4>;

    #[test]
    fn seeded_slot_carries_unit_derivative() {
        let x = D4::seeded(3.0, 1);
        assert_eq!(x.val(), 3.0);
        assert_eq!(x.dx(0), 0.0);
        assert_eq!(x.dx(1), 1.0);
    }

    #[test]
    fn product_rule() {
        let x = D4::seeded(2.0, 0);
        let y = D4::seeded(5.0, 1);
        let z = x * y;
        assert_eq!(z.val(), 10.0);
        assert_eq!(z.dx(0), 5.0); // dz/dx = y
        assert_eq!(z.dx(1), 2.0); // dz/dy = x
    }

    #[test]
    fn quotient_rule() {
        let x = D4::seeded(1.0, 0);
        let y = D4::seeded(4.0, 1);
        let z = x / y;
        assert!((z.val() - 0.25).abs() < 1e-15);
        assert!((z.dx(0) - 0.25).abs() < 1e-15); // 1/y
        assert!((z.dx(1) + 1.0 / 16.0).abs() < 1e-15); // -x/y^2
    }

    #[test]
    fn chain_rule_through_transcendentals() {
        // d/dx exp(sin(x)) = cos(x) exp(sin(x))
        let x = D4::seeded(0.7, 0);
        let z = x.sin().exp();
        let expected = 0.7f64.cos() * 0.7f64.sin().exp();
        assert!((z.dx(0) - expected).abs() < 1e-14);
    }

    #[test]
    fn scaled_seed_applies_chain_factor() {
        // u̇ seeded with du̇/du = α contributes α through a linear term
        let alpha = 100.0;
        let udot = D4::seeded_scaled(2.5, 0, alpha);
        let r = udot * 3.0;
        assert!((r.dx(0) - 3.0 * alpha).abs() < 1e-12);
    }

    #[test]
    fn powi_and_powf_agree() {
        let x = D4::seeded(1.3, 2);
        let a = x.powi(3);
        let b = x.powf(3.0);
        assert!((a.val() - b.val()).abs() < 1e-13);
        assert!((a.dx(2) - b.dx(2)).abs() < 1e-12);
    }

    #[test]
    fn comparisons_use_values_only() {
        let a = D4::seeded(1.0, 0);
        let b = D4::seeded(2.0, 1);
        assert!(a < b);
        assert_eq!(a.max(b).val(), 2.0);
        assert_eq!(a.min(b).dx(0), 1.0);
    }

    #[test]
    fn mixed_f64_operands() {
        let x = D4::seeded(2.0, 0);
        let z = 3.0 * x + 1.0 - x / 2.0;
        assert!((z.val() - 6.0).abs() < 1e-15);
        assert!((z.dx(0) - 2.5).abs() < 1e-15);
    }
}
