//! Affine transforms tagged with the axis order of the points they act on.
//!
//! Volumes are indexed z-y-x and spot coordinates are y-x-z. A transform
//! carries its order as a zero-sized marker so that the two conventions are
//! only ever mixed through an explicit [`Affine::to_order`].

use std::fmt;
use std::marker::PhantomData;

use glam::{DAffine3, DMat3, DVec3};
use serde::{Deserialize, Serialize};

/// Physical axis of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Z,
    Y,
    X,
}

/// Axis order marker.
pub trait AxisOrder: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Physical axis stored at each coordinate slot.
    const AXES: [Axis; 3];
    const NAME: &'static str;

    /// Coordinate slot holding `axis`.
    fn slot(axis: Axis) -> usize {
        Self::AXES
            .iter()
            .position(|&a| a == axis)
            .unwrap_or_else(|| unreachable!("axis order covers every axis"))
    }
}

/// z-y-x order, used for volumes, round and channel transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zyx;

/// y-x-z order, used for spot coordinates and ICP transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Yxz;

impl AxisOrder for Zyx {
    const AXES: [Axis; 3] = [Axis::Z, Axis::Y, Axis::X];
    const NAME: &'static str = "zyx";
}

impl AxisOrder for Yxz {
    const AXES: [Axis; 3] = [Axis::Y, Axis::X, Axis::Z];
    const NAME: &'static str = "yxz";
}

/// Affine map `p' = A·p + t` on points in axis order `O`.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Affine<O: AxisOrder> {
    inner: DAffine3,
    #[serde(skip)]
    order: PhantomData<O>,
}

impl<O: AxisOrder> Default for Affine<O> {
    fn default() -> Self {
        Self::identity()
    }
}

impl<O: AxisOrder> fmt::Debug for Affine<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Affine<{}>{:?}", O::NAME, self.to_rows())
    }
}

impl<O: AxisOrder> fmt::Display for Affine<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.to_rows();
        write!(f, "{}[", O::NAME)?;
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(
                f,
                "{:.4} {:.4} {:.4} | {:.3}",
                row[0], row[1], row[2], row[3]
            )?;
        }
        write!(f, "]")
    }
}

impl<O: AxisOrder> Affine<O> {
    pub fn identity() -> Self {
        Self::from_inner(DAffine3::IDENTITY)
    }

    pub fn from_parts(linear: DMat3, translation: DVec3) -> Self {
        Self::from_inner(DAffine3::from_mat3_translation(linear, translation))
    }

    pub fn from_translation(translation: DVec3) -> Self {
        Self::from_parts(DMat3::IDENTITY, translation)
    }

    /// Builds from the 3×4 row-major form `[A | t]`.
    pub fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        let linear = mat_from_rows([
            [rows[0][0], rows[0][1], rows[0][2]],
            [rows[1][0], rows[1][1], rows[1][2]],
            [rows[2][0], rows[2][1], rows[2][2]],
        ]);
        let translation = DVec3::new(rows[0][3], rows[1][3], rows[2][3]);
        Self::from_parts(linear, translation)
    }

    pub(crate) fn from_inner(inner: DAffine3) -> Self {
        Self {
            inner,
            order: PhantomData,
        }
    }

    pub fn inner(&self) -> DAffine3 {
        self.inner
    }

    pub fn linear(&self) -> DMat3 {
        self.inner.matrix3
    }

    pub fn translation(&self) -> DVec3 {
        self.inner.translation
    }

    pub fn with_translation(&self, translation: DVec3) -> Self {
        Self::from_parts(self.linear(), translation)
    }

    /// 3×4 row-major form `[A | t]`.
    pub fn to_rows(&self) -> [[f64; 4]; 3] {
        let m = self.linear();
        let t = self.translation();
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().take(3).enumerate() {
                *value = m.col(c)[r];
            }
            row[3] = t[r];
        }
        rows
    }

    /// 4×3 row-vector form `T` such that `[p, 1] · T = p'`.
    pub fn to_rows_4x3(&self) -> [[f64; 3]; 4] {
        let rows = self.to_rows();
        let mut out = [[0.0; 3]; 4];
        for (c, row) in rows.iter().enumerate() {
            for (r, &value) in row.iter().enumerate() {
                out[r][c] = value;
            }
        }
        out
    }

    pub fn apply(&self, point: DVec3) -> DVec3 {
        self.inner.transform_point3(point)
    }

    /// Returns the map that applies `self` first and `next` second.
    pub fn then(&self, next: &Affine<O>) -> Affine<O> {
        Self::from_inner(next.inner * self.inner)
    }

    pub fn inverse(&self) -> Option<Affine<O>> {
        let det = self.linear().determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        Some(Self::from_inner(self.inner.inverse()))
    }

    pub fn is_finite(&self) -> bool {
        self.inner.is_finite()
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.abs_diff_eq(&Self::identity(), tolerance)
    }

    pub fn abs_diff_eq(&self, other: &Affine<O>, tolerance: f64) -> bool {
        self.inner.abs_diff_eq(other.inner, tolerance)
    }

    /// Same map expressed for points in axis order `P`.
    pub fn to_order<P: AxisOrder>(&self) -> Affine<P> {
        let src: [usize; 3] = std::array::from_fn(|i| O::slot(P::AXES[i]));
        let rows = self.to_rows();
        let mut out = [[0.0; 4]; 3];
        for i in 0..3 {
            for k in 0..3 {
                out[i][k] = rows[src[i]][src[k]];
            }
            out[i][3] = rows[src[i]][3];
        }
        Affine::from_rows(out)
    }
}

impl Affine<Zyx> {
    pub fn to_yxz(&self) -> Affine<Yxz> {
        self.to_order()
    }
}

impl Affine<Yxz> {
    pub fn to_zyx(&self) -> Affine<Zyx> {
        self.to_order()
    }
}

/// Reorders a point between axis orders.
pub fn reorder_point<O: AxisOrder, P: AxisOrder>(point: DVec3) -> DVec3 {
    DVec3::new(
        point[O::slot(P::AXES[0])],
        point[O::slot(P::AXES[1])],
        point[O::slot(P::AXES[2])],
    )
}

pub(crate) fn mat_from_rows(rows: [[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols_array_2d(&rows).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Affine<Zyx> {
        Affine::from_rows([
            [1.01, 0.002, -0.003, 1.5],
            [0.001, 0.99, 0.02, -3.0],
            [-0.004, -0.01, 1.02, 7.25],
        ])
    }

    #[test]
    fn test_rows_roundtrip() {
        let t = sample();
        let back = Affine::<Zyx>::from_rows(t.to_rows());
        assert!(back.abs_diff_eq(&t, 1e-15));
    }

    #[test]
    fn test_then_applies_in_order() {
        let shift = Affine::<Zyx>::from_translation(DVec3::new(1.0, 2.0, 3.0));
        let scale = Affine::<Zyx>::from_parts(DMat3::from_diagonal(DVec3::splat(2.0)), DVec3::ZERO);
        let p = DVec3::new(1.0, 1.0, 1.0);

        // shift first, then scale
        let combined = shift.then(&scale);
        assert!((combined.apply(p) - DVec3::new(4.0, 6.0, 8.0)).length() < 1e-12);
    }

    #[test]
    fn test_to_order_commutes_with_apply() {
        let t = sample();
        let p_zyx = DVec3::new(3.0, 40.0, 70.0);
        let p_yxz = reorder_point::<Zyx, Yxz>(p_zyx);
        assert_eq!(p_yxz, DVec3::new(40.0, 70.0, 3.0));

        let expected = reorder_point::<Zyx, Yxz>(t.apply(p_zyx));
        let actual = t.to_yxz().apply(p_yxz);
        assert!((expected - actual).length() < 1e-12);
    }

    #[test]
    fn test_to_order_roundtrip() {
        let t = sample();
        assert!(t.to_yxz().to_zyx().abs_diff_eq(&t, 1e-15));
    }

    #[test]
    fn test_rows_4x3_is_transpose() {
        let t = sample().to_yxz();
        let rows = t.to_rows();
        let rows_4x3 = t.to_rows_4x3();
        for r in 0..3 {
            for c in 0..4 {
                assert_eq!(rows[r][c], rows_4x3[c][r]);
            }
        }
    }

    #[test]
    fn test_inverse() {
        let t = sample();
        let inv = t.inverse().unwrap();
        assert!(t.then(&inv).is_identity(1e-12));

        let singular = Affine::<Zyx>::from_parts(DMat3::ZERO, DVec3::ONE);
        assert!(singular.inverse().is_none());
    }

    #[test]
    fn test_serde_uses_plain_numbers() {
        let t = sample();
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("order"));
        let back: Affine<Zyx> = serde_json::from_str(&json).unwrap();
        assert!(back.abs_diff_eq(&t, 1e-15));
    }
}
