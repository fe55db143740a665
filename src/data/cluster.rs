//! Model data and per-cluster design blocks.

use nalgebra::{DMatrix, DVector};

use crate::error::{GlmmError, Result};

/// Input data for one GLMM fit: response, fixed and random design matrices,
/// and the grouping factor, with optional zero-part designs.
///
/// Construction validates dimensions (usage errors) and checks the fixed
/// design(s) for full column rank; rank deficiency leaves the likelihood
/// undefined and is reported as the fatal [`GlmmError::SingularDesign`],
/// distinct from ordinary non-convergence.
#[derive(Debug, Clone)]
pub struct MixedModelData {
    y: DVector<f64>,
    x: DMatrix<f64>,
    group: Vec<String>,
    z: DMatrix<f64>,
    x_zi: Option<DMatrix<f64>>,
    z_zi: Option<DMatrix<f64>>,
}

fn check_rows(name: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(GlmmError::DimensionMismatch { expected, actual });
    }
    let _ = name;
    Ok(())
}

fn check_full_rank(name: &str, m: &DMatrix<f64>) -> Result<()> {
    if m.ncols() == 0 {
        return Err(GlmmError::SingularDesign(format!("{} has no columns", name)));
    }
    let svd = m.clone().svd(false, false);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0f64, f64::max);
    let eps = max_sv * 1e-10;
    let rank = svd.singular_values.iter().filter(|s| **s > eps).count();
    if rank < m.ncols() {
        return Err(GlmmError::SingularDesign(format!(
            "{} is rank deficient: rank {} < {} columns",
            name,
            rank,
            m.ncols()
        )));
    }
    Ok(())
}

impl MixedModelData {
    /// Build and validate the base data (no zero part).
    pub fn new(
        y: DVector<f64>,
        x: DMatrix<f64>,
        group: Vec<String>,
        z: DMatrix<f64>,
    ) -> Result<Self> {
        let n = y.len();
        if n == 0 {
            return Err(GlmmError::InvalidParameter("empty response".to_string()));
        }
        check_rows("fixed design", n, x.nrows())?;
        check_rows("random design", n, z.nrows())?;
        check_rows("grouping factor", n, group.len())?;
        if z.ncols() == 0 {
            return Err(GlmmError::InvalidParameter(
                "random-effects design must have at least one column".to_string(),
            ));
        }
        check_full_rank("fixed-effects design", &x)?;
        Ok(Self {
            y,
            x,
            group,
            z,
            x_zi: None,
            z_zi: None,
        })
    }

    /// Attach zero-part fixed (and optionally random) designs.
    pub fn with_zero_part(mut self, x_zi: DMatrix<f64>, z_zi: Option<DMatrix<f64>>) -> Result<Self> {
        let n = self.y.len();
        check_rows("zero-part fixed design", n, x_zi.nrows())?;
        check_full_rank("zero-part fixed design", &x_zi)?;
        if let Some(ref zz) = z_zi {
            check_rows("zero-part random design", n, zz.nrows())?;
            if zz.ncols() == 0 {
                return Err(GlmmError::InvalidParameter(
                    "zero-part random design must have at least one column".to_string(),
                ));
            }
        }
        self.x_zi = Some(x_zi);
        self.z_zi = z_zi;
        Ok(self)
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_random(&self) -> usize {
        self.z.ncols()
    }

    pub fn n_zi_fixed(&self) -> usize {
        self.x_zi.as_ref().map_or(0, |m| m.ncols())
    }

    pub fn n_zi_random(&self) -> usize {
        self.z_zi.as_ref().map_or(0, |m| m.ncols())
    }

    pub fn has_zero_part(&self) -> bool {
        self.x_zi.is_some()
    }

    pub fn response(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn fixed_design(&self) -> &DMatrix<f64> {
        &self.x
    }

    pub fn zero_fixed_design(&self) -> Option<&DMatrix<f64>> {
        self.x_zi.as_ref()
    }

    /// Split the data into per-cluster blocks, in first-appearance order of
    /// the grouping factor. The split is deterministic so downstream
    /// reductions over clusters are bit-reproducible.
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut order: Vec<&str> = Vec::new();
        let mut members: Vec<Vec<usize>> = Vec::new();
        for (i, g) in self.group.iter().enumerate() {
            match order.iter().position(|o| *o == g.as_str()) {
                Some(k) => members[k].push(i),
                None => {
                    order.push(g.as_str());
                    members.push(vec![i]);
                }
            }
        }

        order
            .iter()
            .zip(members)
            .enumerate()
            .map(|(id, (label, indices))| {
                let take_rows = |m: &DMatrix<f64>| {
                    DMatrix::from_fn(indices.len(), m.ncols(), |r, c| m[(indices[r], c)])
                };
                Cluster {
                    id,
                    label: label.to_string(),
                    y: DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.y[i])),
                    x: take_rows(&self.x),
                    z: take_rows(&self.z),
                    x_zi: self.x_zi.as_ref().map(&take_rows),
                    z_zi: self.z_zi.as_ref().map(&take_rows),
                    indices,
                }
            })
            .collect()
    }
}

/// One cluster's design data: immutable after construction, shared read-only
/// across worker tasks.
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Position in the deterministic cluster ordering.
    pub id: usize,
    /// Original grouping label.
    pub label: String,
    /// Row indices of this cluster in the full data.
    pub indices: Vec<usize>,
    pub y: DVector<f64>,
    pub x: DMatrix<f64>,
    pub z: DMatrix<f64>,
    pub x_zi: Option<DMatrix<f64>>,
    pub z_zi: Option<DMatrix<f64>>,
}

impl Cluster {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    /// Combined random-effects dimension (base plus zero part).
    pub fn re_dim(&self) -> usize {
        self.z.ncols() + self.z_zi.as_ref().map_or(0, |m| m.ncols())
    }
}
