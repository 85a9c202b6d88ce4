//! Jacobian transformations between reference and physical coordinates.
//!
//! `Xd` stores the coordinate derivatives row-wise: row $`a`$ is
//! $`\partial x / \partial \xi_a`$. `J = Xd^{-1}` maps parametric gradients to
//! physical ones: for a scalar field, $`\nabla_x u = J \, \nabla_\xi u`$.
use nalgebra::Matrix3;

use crate::{Param, Vert3d};

/// Transformation for a 2D shell element embedded in 3D.
///
/// The first two rows of `Xd` come from the shape-function derivatives; the
/// third row is the unit normal. A non-positive determinant flags a
/// degenerate element; the caller decides how to handle it.
#[must_use]
pub fn jacobian_2d(xpts: &[Vert3d], dn: &[Param<2>]) -> (Matrix3<f64>, Matrix3<f64>, f64) {
    assert_eq!(xpts.len(), dn.len());
    let mut xd = Matrix3::zeros();
    for (x, d) in xpts.iter().zip(dn.iter()) {
        for a in 0..2 {
            for i in 0..3 {
                xd[(a, i)] += x[i] * d[a];
            }
        }
    }

    let t0 = Vert3d::new(xd[(0, 0)], xd[(0, 1)], xd[(0, 2)]);
    let t1 = Vert3d::new(xd[(1, 0)], xd[(1, 1)], xd[(1, 2)]);
    let normal = t0.cross(&t1);
    let detj = normal.norm();
    if detj > 0.0 {
        let n = normal / detj;
        for i in 0..3 {
            xd[(2, i)] = n[i];
        }
    }

    let j = xd.try_inverse().unwrap_or_else(Matrix3::zeros);
    (xd, j, detj)
}

/// In-surface frame of a shell element: `d1` along the first tangent, `d2`
/// completing the right-handed triad with the normal
#[must_use]
pub fn shell_frame(xd: &Matrix3<f64>) -> (Vert3d, Vert3d) {
    let t0 = Vert3d::new(xd[(0, 0)], xd[(0, 1)], xd[(0, 2)]);
    let n = Vert3d::new(xd[(2, 0)], xd[(2, 1)], xd[(2, 2)]);
    let d1 = t0 / t0.norm();
    let d2 = n.cross(&d1);
    (d1, d2)
}

/// Transformation for a 3D element
#[must_use]
pub fn jacobian_3d(xpts: &[Vert3d], dn: &[Param<3>]) -> (Matrix3<f64>, Matrix3<f64>, f64) {
    assert_eq!(xpts.len(), dn.len());
    let mut xd = Matrix3::zeros();
    for (x, d) in xpts.iter().zip(dn.iter()) {
        for a in 0..3 {
            for i in 0..3 {
                xd[(a, i)] += x[i] * d[a];
            }
        }
    }

    let detj = xd.determinant();
    let j = xd.try_inverse().unwrap_or_else(Matrix3::zeros);
    (xd, j, detj)
}

#[cfg(test)]
mod tests {
    use super::{jacobian_2d, jacobian_3d, shell_frame};
    use crate::{Param, Vert3d, basis};

    #[test]
    fn test_jacobian_3d_box() {
        // element [0, 2] x [0, 1] x [0, 0.5] of order 2
        let order = 2;
        let knots = basis::uniform_knots(order);
        let mut xpts = Vec::new();
        for kk in 0..order {
            for jj in 0..order {
                for ii in 0..order {
                    xpts.push(Vert3d::new(
                        knots[ii] + 1.0,
                        0.5 * (knots[jj] + 1.0),
                        0.25 * (knots[kk] + 1.0),
                    ));
                }
            }
        }

        let pt = Param::<3>::new(0.2, -0.3, 0.4);
        let mut n = vec![0.0; 8];
        let mut dn = vec![Param::<3>::zeros(); 8];
        basis::eval_tensor_deriv(&knots, &pt, &mut n, &mut dn);

        let (xd, j, detj) = jacobian_3d(&xpts, &dn);
        assert_delta!(detj, 0.125, 1e-12);
        assert_delta!(xd[(0, 0)], 1.0, 1e-12);
        assert_delta!(xd[(1, 1)], 0.5, 1e-12);
        assert_delta!(xd[(2, 2)], 0.25, 1e-12);
        assert_delta!(j[(0, 0)], 1.0, 1e-12);
        assert_delta!(j[(1, 1)], 2.0, 1e-12);
        assert_delta!(j[(2, 2)], 4.0, 1e-12);
    }

    #[test]
    fn test_jacobian_2d_frame() {
        // flat shell element in the plane z = 1
        let order = 2;
        let knots = basis::uniform_knots(order);
        let mut xpts = Vec::new();
        for jj in 0..order {
            for ii in 0..order {
                xpts.push(Vert3d::new(knots[ii] + 1.0, 2.0 * (knots[jj] + 1.0), 1.0));
            }
        }

        let pt = Param::<2>::new(0.1, 0.6);
        let mut n = vec![0.0; 4];
        let mut dn = vec![Param::<2>::zeros(); 4];
        basis::eval_tensor_deriv(&knots, &pt, &mut n, &mut dn);

        let (xd, _, detj) = jacobian_2d(&xpts, &dn);
        assert_delta!(detj, 2.0, 1e-12);
        assert_delta!(xd[(2, 0)], 0.0, 1e-12);
        assert_delta!(xd[(2, 1)], 0.0, 1e-12);
        assert_delta!(xd[(2, 2)], 1.0, 1e-12);

        let (d1, d2) = shell_frame(&xd);
        assert_delta!((d1 - Vert3d::new(1.0, 0.0, 0.0)).norm(), 0.0, 1e-12);
        assert_delta!((d2 - Vert3d::new(0.0, 1.0, 0.0)).norm(), 0.0, 1e-12);
    }

    #[test]
    fn test_jacobian_3d_degenerate() {
        // collapsed element: all nodes in a plane
        let order = 2;
        let knots = basis::uniform_knots(order);
        let mut xpts = Vec::new();
        for _kk in 0..order {
            for jj in 0..order {
                for ii in 0..order {
                    xpts.push(Vert3d::new(knots[ii], knots[jj], 0.0));
                }
            }
        }

        let pt = Param::<3>::zeros();
        let mut n = vec![0.0; 8];
        let mut dn = vec![Param::<3>::zeros(); 8];
        basis::eval_tensor_deriv(&knots, &pt, &mut n, &mut dn);

        let (_, _, detj) = jacobian_3d(&xpts, &dn);
        assert!(detj <= 0.0);
    }
}
