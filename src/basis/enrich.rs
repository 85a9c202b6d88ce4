//! Enrichment basis for the patch reconstruction.
//!
//! The enrichment polynomials are products of a one-dimensional bubble along
//! one axis and a polynomial in the remaining axes. The bubble vanishes at
//! every interpolation knot, so the enrichment never perturbs nodal values of
//! the interpolated field. The emission order is fixed: consumers rely on it.
use crate::Param;

/// Number of 2D enrichment functions for a given mesh order
#[must_use]
pub fn n_enrich_2d(order: usize) -> usize {
    match order {
        2 => 5,
        3 => 7,
        _ => 9,
    }
}

/// Number of 3D enrichment functions for a given mesh order
#[must_use]
pub fn n_enrich_3d(order: usize) -> usize {
    if order == 2 { 9 } else { 15 }
}

/// Evaluate the 2D enrichment functions at a parametric point
pub fn eval_enrich_2d(order: usize, pt: &Param<2>, knots: &[f64], n: &mut [f64]) {
    assert_eq!(n.len(), n_enrich_2d(order));
    if order == 2 {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * (1.0 - pt[1]);

        n[0] = ca;
        n[1] = pt[1] * ca;
        n[2] = cb;
        n[3] = pt[0] * cb;
        n[4] = ca * cb;
    } else if order == 3 {
        let ca = (1.0 + pt[0]) * pt[0] * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * pt[1] * (1.0 - pt[1]);

        n[0] = ca;
        n[1] = pt[1] * ca;
        n[2] = pt[1] * pt[1] * ca;
        n[3] = cb;
        n[4] = pt[0] * cb;
        n[5] = pt[0] * pt[0] * cb;
        n[6] = ca * cb;
    } else {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]) * (pt[0] - knots[1]) * (pt[0] - knots[2]);
        let cb = (1.0 + pt[1]) * (1.0 - pt[1]) * (pt[1] - knots[1]) * (pt[1] - knots[2]);

        n[0] = ca;
        n[1] = pt[1] * ca;
        n[2] = pt[1] * pt[1] * ca;
        n[3] = pt[1] * pt[1] * pt[1] * ca;
        n[4] = cb;
        n[5] = pt[0] * cb;
        n[6] = pt[0] * pt[0] * cb;
        n[7] = pt[0] * pt[0] * pt[0] * cb;
        n[8] = ca * cb;
    }
}

/// Evaluate the 2D enrichment functions and their parametric gradients.
///
/// The bubble derivatives are analytic; the product rule is applied term by
/// term.
pub fn eval_enrich_deriv_2d(
    order: usize,
    pt: &Param<2>,
    knots: &[f64],
    n: &mut [f64],
    dn: &mut [Param<2>],
) {
    assert_eq!(dn.len(), n_enrich_2d(order));
    eval_enrich_2d(order, pt, knots, n);

    if order == 2 {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * (1.0 - pt[1]);
        let da = -2.0 * pt[0];
        let db = -2.0 * pt[1];

        dn[0][0] = da;
        dn[1][0] = pt[1] * da;
        dn[2][0] = 0.0;
        dn[3][0] = cb;
        dn[4][0] = da * cb;

        dn[0][1] = 0.0;
        dn[1][1] = ca;
        dn[2][1] = db;
        dn[3][1] = pt[0] * db;
        dn[4][1] = ca * db;
    } else if order == 3 {
        let ca = (1.0 + pt[0]) * pt[0] * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * pt[1] * (1.0 - pt[1]);
        let da = 1.0 - 3.0 * pt[0] * pt[0];
        let db = 1.0 - 3.0 * pt[1] * pt[1];

        dn[0][0] = da;
        dn[1][0] = pt[1] * da;
        dn[2][0] = pt[1] * pt[1] * da;
        dn[3][0] = 0.0;
        dn[4][0] = cb;
        dn[5][0] = 2.0 * pt[0] * cb;
        dn[6][0] = da * cb;

        dn[0][1] = 0.0;
        dn[1][1] = ca;
        dn[2][1] = 2.0 * pt[1] * ca;
        dn[3][1] = db;
        dn[4][1] = pt[0] * db;
        dn[5][1] = pt[0] * pt[0] * db;
        dn[6][1] = ca * db;
    } else {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]) * (pt[0] - knots[1]) * (pt[0] - knots[2]);
        let da = -2.0 * pt[0] * (pt[0] - knots[1]) * (pt[0] - knots[2])
            + (1.0 + pt[0]) * (1.0 - pt[0]) * (2.0 * pt[0] - knots[1] - knots[2]);

        let cb = (1.0 + pt[1]) * (1.0 - pt[1]) * (pt[1] - knots[1]) * (pt[1] - knots[2]);
        let db = -2.0 * pt[1] * (pt[1] - knots[1]) * (pt[1] - knots[2])
            + (1.0 + pt[1]) * (1.0 - pt[1]) * (2.0 * pt[1] - knots[1] - knots[2]);

        dn[0][0] = da;
        dn[1][0] = pt[1] * da;
        dn[2][0] = pt[1] * pt[1] * da;
        dn[3][0] = pt[1] * pt[1] * pt[1] * da;
        dn[4][0] = 0.0;
        dn[5][0] = cb;
        dn[6][0] = 2.0 * pt[0] * cb;
        dn[7][0] = 3.0 * pt[0] * pt[0] * cb;
        dn[8][0] = da * cb;

        dn[0][1] = 0.0;
        dn[1][1] = ca;
        dn[2][1] = 2.0 * pt[1] * ca;
        dn[3][1] = 3.0 * pt[1] * pt[1] * ca;
        dn[4][1] = db;
        dn[5][1] = pt[0] * db;
        dn[6][1] = pt[0] * pt[0] * db;
        dn[7][1] = pt[0] * pt[0] * pt[0] * db;
        dn[8][1] = ca * db;
    }
}

/// Evaluate the 3D enrichment functions at a parametric point
pub fn eval_enrich_3d(order: usize, pt: &Param<3>, n: &mut [f64]) {
    assert_eq!(n.len(), n_enrich_3d(order));
    if order == 2 {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * (1.0 - pt[1]);
        let cc = (1.0 + pt[2]) * (1.0 - pt[2]);

        n[0] = ca;
        n[1] = pt[1] * ca;
        n[2] = pt[2] * ca;
        n[3] = cb;
        n[4] = pt[0] * cb;
        n[5] = pt[2] * cb;
        n[6] = cc;
        n[7] = pt[0] * cc;
        n[8] = pt[1] * cc;
    } else {
        let ca = (1.0 + pt[0]) * pt[0] * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * pt[1] * (1.0 - pt[1]);
        let cc = (1.0 + pt[2]) * pt[2] * (1.0 - pt[2]);

        n[0] = ca;
        n[1] = pt[1] * ca;
        n[2] = pt[1] * pt[1] * ca;
        n[3] = pt[2] * ca;
        n[4] = pt[2] * pt[2] * ca;
        n[5] = cb;
        n[6] = pt[0] * cb;
        n[7] = pt[0] * pt[0] * cb;
        n[8] = pt[2] * cb;
        n[9] = pt[2] * pt[2] * cb;
        n[10] = cc;
        n[11] = pt[0] * cc;
        n[12] = pt[0] * pt[0] * cc;
        n[13] = pt[1] * cc;
        n[14] = pt[1] * pt[1] * cc;
    }
}

/// Evaluate the 3D enrichment functions and their parametric gradients
pub fn eval_enrich_deriv_3d(order: usize, pt: &Param<3>, n: &mut [f64], dn: &mut [Param<3>]) {
    assert_eq!(dn.len(), n_enrich_3d(order));
    eval_enrich_3d(order, pt, n);

    if order == 2 {
        let ca = (1.0 + pt[0]) * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * (1.0 - pt[1]);
        let cc = (1.0 + pt[2]) * (1.0 - pt[2]);
        let da = -2.0 * pt[0];
        let db = -2.0 * pt[1];
        let dc = -2.0 * pt[2];

        dn[0][0] = da;
        dn[1][0] = pt[1] * da;
        dn[2][0] = pt[2] * da;
        dn[3][0] = 0.0;
        dn[4][0] = cb;
        dn[5][0] = 0.0;
        dn[6][0] = 0.0;
        dn[7][0] = cc;
        dn[8][0] = 0.0;

        dn[0][1] = 0.0;
        dn[1][1] = ca;
        dn[2][1] = 0.0;
        dn[3][1] = db;
        dn[4][1] = pt[0] * db;
        dn[5][1] = pt[2] * db;
        dn[6][1] = 0.0;
        dn[7][1] = 0.0;
        dn[8][1] = cc;

        dn[0][2] = 0.0;
        dn[1][2] = 0.0;
        dn[2][2] = ca;
        dn[3][2] = 0.0;
        dn[4][2] = 0.0;
        dn[5][2] = cb;
        dn[6][2] = dc;
        dn[7][2] = pt[0] * dc;
        dn[8][2] = pt[1] * dc;
    } else {
        let ca = (1.0 + pt[0]) * pt[0] * (1.0 - pt[0]);
        let cb = (1.0 + pt[1]) * pt[1] * (1.0 - pt[1]);
        let cc = (1.0 + pt[2]) * pt[2] * (1.0 - pt[2]);
        let da = 1.0 - 3.0 * pt[0] * pt[0];
        let db = 1.0 - 3.0 * pt[1] * pt[1];
        let dc = 1.0 - 3.0 * pt[2] * pt[2];

        dn[0][0] = da;
        dn[1][0] = pt[1] * da;
        dn[2][0] = pt[1] * pt[1] * da;
        dn[3][0] = pt[2] * da;
        dn[4][0] = pt[2] * pt[2] * da;
        dn[5][0] = 0.0;
        dn[6][0] = cb;
        dn[7][0] = 2.0 * pt[0] * cb;
        dn[8][0] = 0.0;
        dn[9][0] = 0.0;
        dn[10][0] = 0.0;
        dn[11][0] = cc;
        dn[12][0] = 2.0 * pt[0] * cc;
        dn[13][0] = 0.0;
        dn[14][0] = 0.0;

        dn[0][1] = 0.0;
        dn[1][1] = ca;
        dn[2][1] = 2.0 * pt[1] * ca;
        dn[3][1] = 0.0;
        dn[4][1] = 0.0;
        dn[5][1] = db;
        dn[6][1] = pt[0] * db;
        dn[7][1] = pt[0] * pt[0] * db;
        dn[8][1] = pt[2] * db;
        dn[9][1] = pt[2] * pt[2] * db;
        dn[10][1] = 0.0;
        dn[11][1] = 0.0;
        dn[12][1] = 0.0;
        dn[13][1] = cc;
        dn[14][1] = 2.0 * pt[1] * cc;

        dn[0][2] = 0.0;
        dn[1][2] = 0.0;
        dn[2][2] = 0.0;
        dn[3][2] = ca;
        dn[4][2] = 2.0 * pt[2] * ca;
        dn[5][2] = 0.0;
        dn[6][2] = 0.0;
        dn[7][2] = 0.0;
        dn[8][2] = cb;
        dn[9][2] = 2.0 * pt[2] * cb;
        dn[10][2] = dc;
        dn[11][2] = pt[0] * dc;
        dn[12][2] = pt[0] * pt[0] * dc;
        dn[13][2] = pt[1] * dc;
        dn[14][2] = pt[1] * pt[1] * dc;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        eval_enrich_2d, eval_enrich_3d, eval_enrich_deriv_2d, eval_enrich_deriv_3d, n_enrich_2d,
        n_enrich_3d,
    };
    use crate::{Param, basis::uniform_knots};

    #[test]
    fn test_enrich_2d_vanishes_at_knots() {
        for order in 2..=4 {
            let knots = uniform_knots(order);
            let mut n = vec![0.0; n_enrich_2d(order)];
            for &kx in &knots {
                for &ky in &knots {
                    eval_enrich_2d(order, &Param::<2>::new(kx, ky), &knots, &mut n);
                    for &v in &n {
                        assert_delta!(v, 0.0, 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn test_enrich_3d_vanishes_at_knots() {
        for order in 2..=3 {
            let knots = uniform_knots(order);
            let mut n = vec![0.0; n_enrich_3d(order)];
            for &kx in &knots {
                for &ky in &knots {
                    for &kz in &knots {
                        eval_enrich_3d(order, &Param::<3>::new(kx, ky, kz), &mut n);
                        for &v in &n {
                            assert_delta!(v, 0.0, 1e-12);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_enrich_2d_deriv_fd() {
        let dh = 1e-6;
        let pt = Param::<2>::new(0.317, -0.48);
        for order in 2..=4 {
            let knots = uniform_knots(order);
            let ne = n_enrich_2d(order);
            let mut n = vec![0.0; ne];
            let mut dn = vec![Param::<2>::zeros(); ne];
            eval_enrich_deriv_2d(order, &pt, &knots, &mut n, &mut dn);

            for d in 0..2 {
                let mut ptp = pt;
                let mut ptm = pt;
                ptp[d] += dh;
                ptm[d] -= dh;
                let mut np = vec![0.0; ne];
                let mut nm = vec![0.0; ne];
                eval_enrich_2d(order, &ptp, &knots, &mut np);
                eval_enrich_2d(order, &ptm, &knots, &mut nm);
                for i in 0..ne {
                    let fd = (np[i] - nm[i]) / (2.0 * dh);
                    assert_delta!(dn[i][d], fd, 1e-8);
                }
            }
        }
    }

    #[test]
    fn test_enrich_3d_deriv_fd() {
        let dh = 1e-6;
        let pt = Param::<3>::new(0.317, -0.48, 0.152);
        for order in 2..=3 {
            let ne = n_enrich_3d(order);
            let mut n = vec![0.0; ne];
            let mut dn = vec![Param::<3>::zeros(); ne];
            eval_enrich_deriv_3d(order, &pt, &mut n, &mut dn);

            for d in 0..3 {
                let mut ptp = pt;
                let mut ptm = pt;
                ptp[d] += dh;
                ptm[d] -= dh;
                let mut np = vec![0.0; ne];
                let mut nm = vec![0.0; ne];
                eval_enrich_3d(order, &ptp, &mut np);
                eval_enrich_3d(order, &ptm, &mut nm);
                for i in 0..ne {
                    let fd = (np[i] - nm[i]) / (2.0 * dh);
                    assert_delta!(dn[i][d], fd, 1e-8);
                }
            }
        }
    }
}
