//! # secp256k1 Field and Point Arithmetic
//!
//! Minimal affine-coordinate arithmetic over the secp256k1 curve, used by
//! the Taproot tweak computation. Every output must byte-for-byte match the
//! Bitcoin consensus rules, so the operations here follow the BIP-340
//! reference algorithms directly instead of going through a signing library.

use lazy_static::lazy_static;
use num_bigint::BigInt;
use num_traits::{One, Zero};

use crate::error::{VaultError, VaultResult};

lazy_static! {
    /// Prime field characteristic: p = 2^256 - 2^32 - 977
    pub static ref FIELD_PRIME: BigInt = bigint_hex(
        "fffffffffffffffffffffffffffffffffffffffffffffffffffffffefffffc2f"
    );

    /// Order of the secp256k1 group
    pub static ref CURVE_ORDER: BigInt = bigint_hex(
        "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141"
    );

    /// Generator point G
    pub static ref GENERATOR: Point = Point {
        x: bigint_hex("79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"),
        y: bigint_hex("483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8"),
    };
}

fn bigint_hex(s: &str) -> BigInt {
    BigInt::parse_bytes(s.as_bytes(), 16).expect("valid hex constant")
}

/// An affine point on the curve. The point at infinity is represented as
/// `None` at the call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub x: BigInt,
    pub y: BigInt,
}

/// Non-negative remainder of `a mod m`
pub fn modulus(a: &BigInt, m: &BigInt) -> BigInt {
    let r = a % m;
    if r < BigInt::zero() {
        r + m
    } else {
        r
    }
}

/// Modular exponentiation `x^y mod m`
pub fn mod_pow(x: &BigInt, y: &BigInt, m: &BigInt) -> BigInt {
    modulus(x, m).modpow(y, m)
}

/// Recover the even-y point for a given x coordinate (BIP-340 `lift_x`).
///
/// Fails with a `Crypto` error when `x` is not a valid field element or has
/// no point on the curve.
pub fn lift_x(x: &BigInt) -> VaultResult<Point> {
    if *x >= *FIELD_PRIME {
        return Err(VaultError::crypto("x exceeds field prime"));
    }
    let p: &BigInt = &FIELD_PRIME;
    let y_sq = (mod_pow(x, &BigInt::from(3u8), p) + 7u8) % p;
    // p % 4 == 3, so a square root (when it exists) is y_sq^((p+1)/4).
    let y = mod_pow(&y_sq, &((p + BigInt::one()) >> 2), p);
    if mod_pow(&y, &BigInt::from(2u8), p) != y_sq {
        return Err(VaultError::crypto("x has no point on the curve"));
    }
    let y = if (&y & BigInt::one()).is_zero() { y } else { p - y };
    Ok(Point { x: x.clone(), y })
}

/// Whether a point's y coordinate is even
pub fn has_even_y(point: &Point) -> bool {
    (&point.y % 2u8).is_zero()
}

/// Add two points; `None` is the point at infinity
pub fn point_add(p1: Option<&Point>, p2: Option<&Point>) -> Option<Point> {
    let (a, b) = match (p1, p2) {
        (None, _) => return p2.cloned(),
        (_, None) => return p1.cloned(),
        (Some(a), Some(b)) => (a, b),
    };
    let p: &BigInt = &FIELD_PRIME;
    if a.x == b.x && a.y != b.y {
        return None;
    }
    let lam = if a.x == b.x && a.y == b.y {
        modulus(
            &(3u8 * &a.x * &a.x * mod_pow(&(2u8 * &a.y), &(p - 2u8), p)),
            p,
        )
    } else {
        modulus(&((&b.y - &a.y) * mod_pow(&(&b.x - &a.x), &(p - 2u8), p)), p)
    };
    let x3 = modulus(&(&lam * &lam - &a.x - &b.x), p);
    let y3 = modulus(&(&lam * (&a.x - &x3) - &a.y), p);
    Some(Point { x: x3, y: y3 })
}

/// Scalar multiplication by double-and-add over 256 bits
pub fn point_mul(point: &Point, n: &BigInt) -> Option<Point> {
    let mut result: Option<Point> = None;
    let mut addend = Some(point.clone());
    for i in 0..256u32 {
        if ((n >> i) & BigInt::one()).is_one() {
            result = point_add(result.as_ref(), addend.as_ref());
        }
        addend = point_add(addend.as_ref(), addend.as_ref());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_is_on_curve() {
        let lifted = lift_x(&GENERATOR.x).unwrap();
        assert_eq!(lifted, *GENERATOR);
        assert!(has_even_y(&GENERATOR));
    }

    #[test]
    fn test_lift_x_rejects_invalid_field_elements() {
        assert!(lift_x(&FIELD_PRIME).is_err());
        // 5 is a known non-residue x on secp256k1 (x^3 + 7 = 132 has no root).
        assert!(lift_x(&BigInt::from(5u8)).is_err());
    }

    #[test]
    fn test_point_arithmetic_consistency() {
        let one = point_mul(&GENERATOR, &BigInt::one()).unwrap();
        assert_eq!(one, *GENERATOR);

        let doubled = point_add(Some(&GENERATOR), Some(&GENERATOR)).unwrap();
        let two = point_mul(&GENERATOR, &BigInt::from(2u8)).unwrap();
        assert_eq!(doubled, two);

        let three_a = point_mul(&GENERATOR, &BigInt::from(3u8)).unwrap();
        let three_b = point_add(Some(&doubled), Some(&GENERATOR)).unwrap();
        assert_eq!(three_a, three_b);
    }

    #[test]
    fn test_known_multiple() {
        // 2G, from the canonical secp256k1 test vectors.
        let two_g = point_mul(&GENERATOR, &BigInt::from(2u8)).unwrap();
        assert_eq!(
            two_g.x,
            BigInt::parse_bytes(
                b"c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5",
                16
            )
            .unwrap()
        );
    }

    #[test]
    fn test_order_times_g_is_infinity() {
        assert!(point_mul(&GENERATOR, &CURVE_ORDER).is_none());
    }

    #[test]
    fn test_mod_pow_matches_fermat_inverse() {
        let p: &BigInt = &FIELD_PRIME;
        let x = BigInt::from(123456789u64);
        let inv = mod_pow(&x, &(p - 2u8), p);
        assert!((x * inv % p).is_one());
    }
}
