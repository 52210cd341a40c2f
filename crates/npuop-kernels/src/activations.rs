//! Scalar activation math used by the reference kernel variants.
//!
//! Everything is evaluated in `f32` after widening from the storage dtype;
//! the erf path goes through `f64` for accuracy.

use std::f32::consts::PI;

const GELU_TANH_COEFF: f32 = 0.044715;

// ── Forward ─────────────────────────────────────────────────────────

/// ReLU: max(0, x), preserving NaN
#[inline]
pub fn relu(x: f32) -> f32 {
    if x.is_nan() { x } else { x.max(0.0) }
}

/// ELU with output and input scaling:
/// `scale * (x > 0 ? x : alpha * (exp(input_scale * x) - 1))`
#[inline]
pub fn elu(x: f32, alpha: f32, scale: f32, input_scale: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    let inner = if x > 0.0 { x } else { alpha * ((input_scale * x).exp() - 1.0) };
    scale * inner
}

/// GELU, erf form: x * Φ(x)
#[inline]
pub fn gelu_erf(x: f32) -> f32 {
    let xd = x as f64;
    (xd * std_normal_cdf(xd)) as f32
}

/// GELU, tanh form: 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
#[inline]
pub fn gelu_tanh(x: f32) -> f32 {
    let u = tanh_arg(x);
    0.5 * x * (1.0 + u.tanh())
}

// ── Derivatives ─────────────────────────────────────────────────────

#[inline]
fn tanh_arg(x: f32) -> f32 {
    (2.0 / PI).sqrt() * (x + GELU_TANH_COEFF * x * x * x)
}

#[inline]
fn std_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

/// d/dx of [`gelu_tanh`].
#[inline]
pub fn gelu_tanh_grad(x: f32) -> f32 {
    let t = tanh_arg(x).tanh();
    let du = (2.0 / PI).sqrt() * (1.0 + 3.0 * GELU_TANH_COEFF * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
}

/// d/dx of [`gelu_erf`]: Φ(x) + x φ(x).
#[inline]
pub fn gelu_erf_grad(x: f32) -> f32 {
    let xd = x as f64;
    let pdf = (-0.5 * xd * xd).exp() / (2.0 * std::f64::consts::PI).sqrt();
    (std_normal_cdf(xd) + xd * pdf) as f32
}
