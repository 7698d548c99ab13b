//! Sine and cosine integrals.
//!
//! $$
//! \mathrm{Si}(x) = \int_0^x \frac{\sin t}{t}\,dt, \qquad
//! \mathrm{Ci}(x) = \gamma + \ln x + \int_0^x \frac{\cos t - 1}{t}\,dt
//! $$
//!
//! Used by the filtered coupled dipole interaction terms. For $|x| > 2$ the
//! pair is evaluated from the complex continued fraction for $E_1(ix)$ with
//! the modified Lentz method; otherwise both power series are summed together.

use num_complex::Complex64;
use thiserror::Error;

/// Relative error target, or absolute error near a zero of Ci.
const EPS: f64 = f64::EPSILON;
/// Iteration cap for both the continued fraction and the series.
const MAX_ITER: usize = 100;
/// Dividing line between the series and the continued fraction.
const T_MIN: f64 = 2.0;
/// A number near the overflow limit; also the magnitude returned for Ci(0).
pub const CI_ZERO: f64 = -f64::MAX * EPS;
/// A number close to the smallest representable positive value.
const FP_MIN: f64 = f64::MIN_POSITIVE * 4.0;
/// Euler-Mascheroni constant.
const EULER: f64 = 0.577_215_664_901_532_9;

/// Error raised when neither expansion converges within the iteration cap.
#[derive(Debug, Error)]
#[error("Failed to converge during calculation of sine integral of {x:e}")]
pub struct CisiError {
    pub x: f64,
}

/// Compute the cosine and sine integrals `(Ci(x), Si(x))`.
///
/// `Ci(0)` is returned as [`CI_ZERO`], a large negative number, without error.
/// For negative `x` the result is `(Ci(-x), -Si(-x))`: the sine integral is
/// correct, while the true cosine integral would be `Ci(-x) - iπ`.
pub fn cisi(x: f64) -> Result<(f64, f64), CisiError> {
    let t = x.abs();
    if x == 0.0 {
        return Ok((CI_ZERO, 0.0));
    }

    let (ci, si) = if t > T_MIN {
        continued_fraction(t).ok_or(CisiError { x })?
    } else {
        power_series(t).ok_or(CisiError { x })?
    };

    Ok(if x < 0.0 { (ci, -si) } else { (ci, si) })
}

/// Modified Lentz evaluation of the continued fraction for $E_1(it)$.
fn continued_fraction(t: f64) -> Option<(f64, f64)> {
    let mut b = Complex64::new(1.0, t);
    // c starts at infinity; 1/c is then evaluated as zero without overflow.
    let mut c = Complex64::new(-CI_ZERO, 0.0);
    let mut d = b.inv();
    let mut h = d;

    let mut converged = false;
    for i in 1..MAX_ITER {
        let a = -((i * i) as f64);
        b += 2.0;
        d = (d * a + b).inv();
        c = b + c.inv() * a;
        let del = c * d;
        h *= del;
        if (del.re - 1.0).abs() + del.im.abs() <= EPS {
            converged = true;
            break;
        }
    }
    if !converged {
        return None;
    }

    h *= Complex64::new(t.cos(), -t.sin());
    Some((-h.re, std::f64::consts::FRAC_PI_2 + h.im))
}

/// Sum the Si and Ci series simultaneously, alternating between them.
fn power_series(t: f64) -> Option<(f64, f64)> {
    // Avoid a failed convergence test because of underflow.
    if t < FP_MIN.sqrt() {
        return Some((t.ln() + EULER, t));
    }

    let (mut sum, mut sums, mut sumc) = (0.0_f64, 0.0_f64, 0.0_f64);
    let mut sign = 1.0;
    let mut fact = 1.0;
    let mut odd = true;
    let mut converged = false;

    for k in 1..=MAX_ITER {
        let kf = k as f64;
        fact *= t / kf;
        let term = fact / kf;
        sum += sign * term;
        let err = term / sum.abs();
        if odd {
            sign = -sign;
            sums = sum;
            sum = sumc;
        } else {
            sumc = sum;
            sum = sums;
        }
        if err < EPS {
            converged = true;
            break;
        }
        odd = !odd;
    }

    converged.then(|| (sumc + t.ln() + EULER, sums))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    // Abramowitz & Stegun, Table 5.1
    const REFERENCE: [(f64, f64, f64); 5] = [
        (0.5, -0.177_784_078_806_612_1, 0.493_107_418_043_066_7),
        (1.0, 0.337_403_922_900_968_1, 0.946_083_070_367_183),
        (2.0, 0.422_980_828_774_865, 1.605_412_976_802_695),
        (3.0, 0.119_629_786_008_000_3, 1.848_652_527_999_468),
        (10.0, -0.045_456_433_004_455_4, 1.658_347_594_218_874),
    ];

    #[test]
    fn test_reference_values() {
        for &(x, ci_ref, si_ref) in &REFERENCE {
            let (ci, si) = cisi(x).unwrap();
            assert_abs_diff_eq!(ci, ci_ref, epsilon = 1e-12);
            assert_abs_diff_eq!(si, si_ref, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_returns_sentinel() {
        let (ci, si) = cisi(0.0).unwrap();
        assert_eq!(si, 0.0);
        assert_eq!(ci, CI_ZERO);
        assert!(ci < -1e290);
    }

    #[test]
    fn test_si_is_odd_and_ci_is_mirrored() {
        for &x in &[1e-200, 1e-3, 0.7, 1.999, 2.0, 2.001, 5.5, 37.0] {
            let (ci_p, si_p) = cisi(x).unwrap();
            let (ci_n, si_n) = cisi(-x).unwrap();
            assert_eq!(si_n, -si_p);
            assert_eq!(ci_n, ci_p);
        }
    }

    #[test]
    fn test_branches_agree_at_boundary() {
        // Series just below the boundary, continued fraction just above.
        let below = power_series(2.0).unwrap();
        let above = continued_fraction(2.0).unwrap();
        assert_abs_diff_eq!(below.0, above.0, epsilon = 1e-14);
        assert_abs_diff_eq!(below.1, above.1, epsilon = 1e-14);
    }

    #[test]
    fn test_tiny_argument_underflow_path() {
        let x = 1e-160;
        let (ci, si) = cisi(x).unwrap();
        assert_eq!(si, x);
        assert_abs_diff_eq!(ci, x.ln() + EULER, epsilon = 1e-12);
    }

    #[test]
    fn test_large_argument_tends_to_half_pi() {
        let (ci, si) = cisi(1e4).unwrap();
        assert_abs_diff_eq!(si, std::f64::consts::FRAC_PI_2, epsilon = 1e-4);
        assert_abs_diff_eq!(ci, 0.0, epsilon = 1e-4);
    }
}
