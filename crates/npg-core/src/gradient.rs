//! Learnable parameters and parameter-indexed vectors.
//!
//! A [`ParameterGradient`] is the vocabulary the solver speaks: gradients,
//! candidate directions and Conjugate Gradient state are all maps from a
//! parameter identity to a tensor shaped like that parameter.

use crate::error::{NpgError, Result};
use crate::types::Tensor;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque, process-unique handle to one learnable tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(u64);

impl ParamId {
    /// Allocates a fresh identity.
    pub fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param#{}", self.0)
    }
}

/// A learnable tensor with a stable identity.
///
/// Parameters are deliberately not `Clone`: copying a value under the same
/// identity would make two tensors indistinguishable as map keys. Use
/// [`Parameter::duplicate`] to obtain an equal value under a new identity.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    value: Tensor,
    name: Option<String>,
}

impl Parameter {
    /// Creates a parameter with a fresh identity.
    pub fn new(value: Tensor) -> Self {
        Self {
            id: ParamId::fresh(),
            value,
            name: None,
        }
    }

    /// Creates a named parameter with a fresh identity.
    pub fn named(value: Tensor, name: impl Into<String>) -> Self {
        Self {
            id: ParamId::fresh(),
            value,
            name: Some(name.into()),
        }
    }

    /// Copies the value under a fresh identity.
    pub fn duplicate(&self) -> Self {
        Self {
            id: ParamId::fresh(),
            value: self.value.clone(),
            name: self.name.clone(),
        }
    }

    /// The identity of this parameter.
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// The current value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Mutable access to the value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Optional debugging name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `(rows, cols)` of the value.
    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }

    /// Number of scalar entries.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the parameter holds no entries.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Mapping from parameter identity to a tensor of matching shape.
///
/// Iteration follows identity order, so reductions such as [`dot`](Self::dot)
/// are reproducible run to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterGradient {
    entries: BTreeMap<ParamId, Tensor>,
}

impl ParameterGradient {
    /// Creates an empty gradient.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero gradient with one entry per parameter.
    pub fn zeros(params: &[&Parameter]) -> Self {
        let entries = params
            .iter()
            .map(|p| (p.id(), Tensor::zeros(p.value().nrows(), p.value().ncols())))
            .collect();
        Self { entries }
    }

    /// A zero gradient with the same keys and shapes as `self`.
    pub fn zeros_like(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(id, t)| (*id, Tensor::zeros(t.nrows(), t.ncols())))
            .collect();
        Self { entries }
    }

    /// Inserts or replaces the entry for `id`.
    pub fn insert(&mut self, id: ParamId, value: Tensor) -> Option<Tensor> {
        self.entries.insert(id, value)
    }

    /// The entry for `id`.
    pub fn get(&self, id: ParamId) -> Option<&Tensor> {
        self.entries.get(&id)
    }

    /// Mutable entry for `id`.
    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut Tensor> {
        self.entries.get_mut(&id)
    }

    /// Whether `id` has an entry.
    pub fn contains(&self, id: ParamId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(identity, tensor)` pairs in identity order.
    pub fn iter(&self) -> btree_map::Iter<'_, ParamId, Tensor> {
        self.entries.iter()
    }

    /// Iterates over the identities in order.
    pub fn keys(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.entries.keys().copied()
    }

    /// Sum over parameters of the element-wise dot product.
    ///
    /// Entries missing from `other` contribute zero.
    pub fn dot(&self, other: &ParameterGradient) -> f64 {
        self.entries
            .iter()
            .filter_map(|(id, t)| other.entries.get(id).map(|o| t.dot(o)))
            .sum()
    }

    /// Euclidean norm over all entries.
    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for t in self.entries.values_mut() {
            *t *= factor;
        }
    }

    /// `self += alpha * other`, applied per parameter.
    ///
    /// Entries of `other` without a counterpart in `self` are ignored.
    pub fn add_scaled(&mut self, alpha: f64, other: &ParameterGradient) {
        for (id, t) in self.entries.iter_mut() {
            if let Some(o) = other.entries.get(id) {
                *t += o * alpha;
            }
        }
    }

    /// Checks that every key belongs to `params` with a matching shape.
    pub fn check_params(&self, params: &[&Parameter]) -> Result<()> {
        for (id, t) in &self.entries {
            let param = params
                .iter()
                .find(|p| p.id() == *id)
                .ok_or_else(|| NpgError::unknown_parameter(id))?;
            if param.shape() != t.shape() {
                return Err(NpgError::shape_mismatch(
                    format!("{:?} for {}", param.shape(), id),
                    format!("{:?}", t.shape()),
                ));
            }
        }
        Ok(())
    }

    /// Adds each entry to the value of the matching parameter.
    pub fn add_to_params(&self, params: &mut [&mut Parameter]) -> Result<()> {
        for param in params.iter_mut() {
            if let Some(t) = self.entries.get(&param.id()) {
                if t.shape() != param.shape() {
                    return Err(NpgError::shape_mismatch(
                        format!("{:?}", param.shape()),
                        format!("{:?}", t.shape()),
                    ));
                }
                *param.value_mut() += t;
            }
        }
        Ok(())
    }
}

impl FromIterator<(ParamId, Tensor)> for ParameterGradient {
    fn from_iter<I: IntoIterator<Item = (ParamId, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ParameterGradient {
    type Item = (&'a ParamId, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, ParamId, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> (Parameter, Parameter) {
        (
            Parameter::new(Tensor::from_row_slice(1, 2, &[1.0, 2.0])),
            Parameter::named(Tensor::from_row_slice(2, 1, &[3.0, 4.0]), "bias"),
        )
    }

    #[test]
    fn test_fresh_identities() {
        let (a, b) = params();
        assert_ne!(a.id(), b.id());
        let c = a.duplicate();
        assert_ne!(a.id(), c.id());
        assert_eq!(a.value(), c.value());
        assert_eq!(b.name(), Some("bias"));
    }

    #[test]
    fn test_dot_and_axpy() {
        let (a, b) = params();
        let mut g = ParameterGradient::zeros(&[&a, &b]);
        g.insert(a.id(), Tensor::from_row_slice(1, 2, &[1.0, 1.0]));
        g.insert(b.id(), Tensor::from_row_slice(2, 1, &[2.0, 0.0]));
        assert_relative_eq!(g.dot(&g), 6.0);

        let mut h = g.zeros_like();
        h.add_scaled(0.5, &g);
        assert_relative_eq!(h.dot(&g), 3.0);
        h.scale(2.0);
        assert_eq!(h, g);
        assert_relative_eq!(g.norm(), 6.0_f64.sqrt());
    }

    #[test]
    fn test_check_params() {
        let (a, b) = params();
        let mut g = ParameterGradient::zeros(&[&a]);
        assert!(g.check_params(&[&a, &b]).is_ok());

        g.insert(b.id(), Tensor::zeros(1, 2));
        assert!(matches!(
            g.check_params(&[&a, &b]),
            Err(NpgError::ShapeMismatch { .. })
        ));

        let stray = Parameter::new(Tensor::zeros(1, 1));
        let g = ParameterGradient::zeros(&[&stray]);
        assert!(matches!(
            g.check_params(&[&a, &b]),
            Err(NpgError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_add_to_params() {
        let (mut a, mut b) = params();
        let mut g = ParameterGradient::zeros(&[&a]);
        g.get_mut(a.id()).unwrap().fill(1.0);
        g.add_to_params(&mut [&mut a, &mut b]).unwrap();
        assert_eq!(a.value(), &Tensor::from_row_slice(1, 2, &[2.0, 3.0]));
        assert_eq!(b.value(), &Tensor::from_row_slice(2, 1, &[3.0, 4.0]));
    }
}
