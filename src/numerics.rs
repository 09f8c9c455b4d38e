//! Array helpers shared by the aggregator and the derived variables.
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};

#[derive(Debug, thiserror::Error)]
pub enum NumericsError {
    #[error("Axis {axis} is out of range for an array with {ndim} dimensions")]
    AxisOutOfRange { axis: usize, ndim: usize },
    #[error("Need at least {needed} points along axis {axis}, found {found}")]
    TooShort {
        axis: usize,
        needed: usize,
        found: usize,
    },
    #[error("Coordinate has {coord} points but the data have {data} along the integration axis")]
    LengthMismatch { coord: usize, data: usize },
    #[error("Cannot broadcast shape {from:?} with shape {to:?}")]
    Broadcast { from: Vec<usize>, to: Vec<usize> },
}

fn check_axis(ndim: usize, axis: usize) -> Result<(), NumericsError> {
    if axis < ndim {
        Ok(())
    } else {
        Err(NumericsError::AxisOutOfRange { axis, ndim })
    }
}

/// Maximum of two values that propagates NaNs (unlike [`f64::max`]).
pub fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// Minimum of two values that propagates NaNs (unlike [`f64::min`]).
pub fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

/// Centered finite difference along `axis`.
///
/// Interior points use `(x[i+1] - x[i-1]) / (2 delta)`, the first and last points
/// use one-sided differences divided by `delta`. The output has the same shape as
/// the input. At least two points are required along `axis`.
pub fn centered_difference(
    data: &ArrayViewD<f64>,
    axis: usize,
    delta: f64,
) -> Result<ArrayD<f64>, NumericsError> {
    check_axis(data.ndim(), axis)?;
    let n = data.len_of(Axis(axis));
    if n < 2 {
        return Err(NumericsError::TooShort {
            axis,
            needed: 2,
            found: n,
        });
    }

    let ax = Axis(axis);
    let upper = data.slice_axis(ax, Slice::from(1..));
    let lower = data.slice_axis(ax, Slice::from(..n - 1));
    let diff = &upper - &lower;

    let mut out = ArrayD::<f64>::zeros(data.raw_dim());
    {
        let mut tail = out.slice_axis_mut(ax, Slice::from(1..));
        tail += &diff;
    }
    {
        let mut head = out.slice_axis_mut(ax, Slice::from(..n - 1));
        head += &diff;
    }

    if n > 2 {
        out.slice_axis_mut(ax, Slice::from(1..n - 1))
            .mapv_inplace(|v| v / (2.0 * delta));
    }
    out.index_axis_mut(ax, 0).mapv_inplace(|v| v / delta);
    out.index_axis_mut(ax, n - 1).mapv_inplace(|v| v / delta);
    Ok(out)
}

/// Integrate `y` over the coordinate `x` along `axis` with Simpson's rule.
///
/// The intervals need not be equal. With an odd number of intervals, Simpson's
/// rule is applied to all but the last interval, which uses the trapezoidal rule.
/// The result has `axis` removed.
pub fn simpson(y: &ArrayViewD<f64>, x: &[f64], axis: usize) -> Result<ArrayD<f64>, NumericsError> {
    check_axis(y.ndim(), axis)?;
    let n = y.len_of(Axis(axis));
    if x.len() != n {
        return Err(NumericsError::LengthMismatch {
            coord: x.len(),
            data: n,
        });
    }
    if n < 2 {
        return Err(NumericsError::TooShort {
            axis,
            needed: 2,
            found: n,
        });
    }

    let ax = Axis(axis);
    let mut result = ArrayD::<f64>::zeros(y.index_axis(ax, 0).raw_dim());
    let simpson_stop = if n % 2 == 1 { n - 2 } else { n.saturating_sub(3) };
    for i in (0..simpson_stop).step_by(2) {
        let h0 = x[i + 1] - x[i];
        let h1 = x[i + 2] - x[i + 1];
        let hsum = h0 + h1;
        let hprod = h0 * h1;
        let h0divh1 = h0 / h1;
        let w0 = hsum / 6.0 * (2.0 - 1.0 / h0divh1);
        let w1 = hsum / 6.0 * hsum * hsum / hprod;
        let w2 = hsum / 6.0 * (2.0 - h0divh1);
        Zip::from(&mut result)
            .and(y.index_axis(ax, i))
            .and(y.index_axis(ax, i + 1))
            .and(y.index_axis(ax, i + 2))
            .for_each(|r, &y0, &y1, &y2| *r += w0 * y0 + w1 * y1 + w2 * y2);
    }

    if n % 2 == 0 {
        let h = x[n - 1] - x[n - 2];
        Zip::from(&mut result)
            .and(y.index_axis(ax, n - 2))
            .and(y.index_axis(ax, n - 1))
            .for_each(|r, &ya, &yb| *r += 0.5 * h * (ya + yb));
    }
    Ok(result)
}

/// The shape two arrays broadcast to, following the usual trailing-axis rules.
pub fn co_broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, NumericsError> {
    let ndim = a.len().max(b.len());
    let mut shape = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        shape[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(NumericsError::Broadcast {
                    from: a.to_vec(),
                    to: b.to_vec(),
                })
            }
        };
    }
    Ok(shape)
}

/// Broadcast `arr` to `shape`, returning an error instead of `None` on failure.
pub fn broadcast_to<'a>(
    arr: &'a ArrayD<f64>,
    shape: &[usize],
) -> Result<ArrayViewD<'a, f64>, NumericsError> {
    arr.broadcast(IxDyn(shape)).ok_or_else(|| NumericsError::Broadcast {
        from: arr.shape().to_vec(),
        to: shape.to_vec(),
    })
}

/// Apply `f` elementwise to two arrays after broadcasting them against each other.
pub fn broadcast_binary<F>(a: &ArrayD<f64>, b: &ArrayD<f64>, f: F) -> Result<ArrayD<f64>, NumericsError>
where
    F: Fn(f64, f64) -> f64,
{
    let shape = co_broadcast_shape(a.shape(), b.shape())?;
    let av = broadcast_to(a, &shape)?;
    let bv = broadcast_to(b, &shape)?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

/// Replace every element equal to `sentinel` with NaN.
pub fn mask_sentinel(arr: &mut ArrayD<f64>, sentinel: f64) {
    arr.mapv_inplace(|v| if v == sentinel { f64::NAN } else { v });
}

/// Replace every NaN with `sentinel`.
pub fn fill_nan(arr: &ArrayViewD<f64>, sentinel: f64) -> ArrayD<f64> {
    arr.mapv(|v| if v.is_nan() { sentinel } else { v })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_centered_difference() {
        let x = array![1.0, 2.0, 4.0, 7.0, 11.0].into_dyn();
        let d = centered_difference(&x.view(), 0, 1.0).unwrap();
        let expected = array![1.0, 1.5, 2.5, 3.5, 4.0].into_dyn();
        assert_eq!(d, expected);

        let d2 = centered_difference(&x.view(), 0, 2.0).unwrap();
        assert_eq!(d2, expected / 2.0);
    }

    #[test]
    fn test_centered_difference_two_points() {
        let x = array![[0.0, 10.0], [3.0, 14.0]].into_dyn();
        let d = centered_difference(&x.view(), 0, 1.0).unwrap();
        assert_eq!(d, array![[3.0, 4.0], [3.0, 4.0]].into_dyn());
        let d = centered_difference(&x.view(), 1, 1.0).unwrap();
        assert_eq!(d, array![[10.0, 10.0], [11.0, 11.0]].into_dyn());
    }

    #[test]
    fn test_centered_difference_needs_two_points() {
        let x = array![1.0].into_dyn();
        assert!(centered_difference(&x.view(), 0, 1.0).is_err());
        assert!(centered_difference(&x.view(), 1, 1.0).is_err());
    }

    #[test]
    fn test_simpson_uniform() {
        // integral of x^2 on [0, 4] is exact for Simpson's rule
        let x: Vec<f64> = (0..5).map(|i| i as f64).collect();
        let y = Array1::from_iter(x.iter().map(|v| v * v)).into_dyn();
        let res = simpson(&y.view(), &x, 0).unwrap();
        assert_abs_diff_eq!(res[[]], 64.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simpson_nonuniform() {
        let x = vec![0.0, 1.0, 3.0];
        let y = Array1::from_iter(x.iter().map(|v| v * v)).into_dyn();
        let res = simpson(&y.view(), &x, 0).unwrap();
        assert_abs_diff_eq!(res[[]], 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simpson_even_points_trapezoid_last() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y = array![1.0, 1.0, 1.0, 3.0].into_dyn();
        // Simpson over [0, 2] gives 2, trapezoid over [2, 3] gives 2
        let res = simpson(&y.view(), &x, 0).unwrap();
        assert_abs_diff_eq!(res[[]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simpson_two_points() {
        let res = simpson(&array![1.0, 3.0].into_dyn().view(), &[0.0, 2.0], 0).unwrap();
        assert_abs_diff_eq!(res[[]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simpson_along_inner_axis() {
        let x = vec![0.0, 0.5, 1.0];
        let y = array![[1.0, 1.0, 1.0], [0.0, 1.0, 2.0]].into_dyn();
        let res = simpson(&y.view(), &x, 1).unwrap();
        assert_abs_diff_eq!(res[[0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res[[1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_nan_extrema() {
        assert_eq!(nan_max(5.0, 7.0), 7.0);
        assert_eq!(nan_min(3.0, 1.0), 1.0);
        assert!(nan_max(f64::NAN, 1.0).is_nan());
        assert!(nan_min(1.0, f64::NAN).is_nan());
    }

    #[test]
    fn test_broadcast_binary() {
        let a = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let b = array![10.0, 20.0].into_dyn();
        let c = broadcast_binary(&a, &b, |x, y| x * y).unwrap();
        assert_eq!(c, array![[10.0, 40.0], [30.0, 80.0]].into_dyn());

        let bad = array![1.0, 2.0, 3.0].into_dyn();
        assert!(broadcast_binary(&a, &bad, |x, y| x + y).is_err());
    }
}
