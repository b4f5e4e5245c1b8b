use crate::traits::Scalar;
use num_traits::{One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Dual number for forward-mode AD.
/// val: real part
/// eps: derivative along the seeded direction
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// Chain rule for a unary function with value `f` and derivative `df`.
    fn chain(self, f: f64, df: f64) -> Self {
        Self::new(f, df * self.eps)
    }
}

/// Lifts `values` into dual space with a unit tangent on `direction`.
pub fn seed(values: &[f64], direction: usize, out: &mut Vec<Dual>) {
    out.clear();
    out.extend(
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Dual::new(v, if i == direction { 1.0 } else { 0.0 })),
    );
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Scalar for Dual {
    fn value(self) -> f64 {
        self.val
    }

    fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    fn powf(self, exponent: Self) -> Self {
        let val = self.val.powf(exponent.val);
        // d(a^b) = b a^(b-1) da + a^b ln(a) db; the second term vanishes for a
        // constant exponent, which keeps negative bases usable.
        let mut eps = if self.eps == 0.0 {
            0.0
        } else {
            exponent.val * self.val.powf(exponent.val - 1.0) * self.eps
        };
        if exponent.eps != 0.0 {
            eps += val * self.val.ln() * exponent.eps;
        }
        Self::new(val, eps)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }

    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }

    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }

    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }

    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }

    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }

    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }

    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }

    fn abs(self) -> Self {
        let slope = if self.val > 0.0 {
            1.0
        } else if self.val < 0.0 {
            -1.0
        } else {
            0.0
        };
        self.chain(self.val.abs(), slope)
    }

    fn floor(self) -> Self {
        self.chain(self.val.floor(), 0.0)
    }

    fn ceil(self) -> Self {
        self.chain(self.val.ceil(), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{seed, Dual};
    use crate::traits::Scalar;
    use approx::assert_relative_eq;

    #[test]
    fn product_rule() {
        let x = Dual::new(3.0, 1.0);
        let y = Dual::new(4.0, 0.0);
        let z = x * y + x * x;
        assert_relative_eq!(z.val, 21.0);
        assert_relative_eq!(z.eps, 4.0 + 6.0);
    }

    #[test]
    fn quotient_and_exp() {
        let x = Dual::new(2.0, 1.0);
        let z = Scalar::exp(x) / x;
        let expected = 2.0_f64.exp() * (2.0 - 1.0) / 4.0;
        assert_relative_eq!(z.eps, expected, epsilon = 1e-12);
    }

    #[test]
    fn power_with_constant_exponent_handles_negative_base() {
        let x = Dual::new(-2.0, 1.0);
        let z = x.powf(Dual::constant(3.0));
        assert_relative_eq!(z.val, -8.0);
        assert_relative_eq!(z.eps, 12.0);
    }

    #[test]
    fn power_with_variable_exponent() {
        let b = Dual::constant(2.0);
        let e = Dual::new(3.0, 1.0);
        let z = b.powf(e);
        assert_relative_eq!(z.eps, 8.0 * 2.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn seed_sets_single_direction() {
        let mut out = Vec::new();
        seed(&[1.0, 2.0, 3.0], 1, &mut out);
        assert_eq!(out[0].eps, 0.0);
        assert_eq!(out[1].eps, 1.0);
        assert_eq!(out[2].eps, 0.0);
        assert_eq!(out[2].val, 3.0);
    }
}
