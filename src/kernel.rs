//! Convolution kernels and the kernel registry
//!
//! A [`Kernel`] is a validated odd-sized square matrix of weights. The
//! registry maps names and numeric ids to a kernel plus the multiplier that
//! is applied after the weighted sum. It is built once at startup and shared
//! read-only.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Square matrix of convolution weights, `size` is odd
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    size: usize,
    weights: Vec<f32>,
}

impl Kernel {
    /// Build a kernel from its rows
    ///
    /// Weight `rows[dk][dl]` multiplies the sample taken `dk - size/2` pixels
    /// along x and `dl - size/2` pixels along y.
    pub fn new(rows: &[Vec<f32>]) -> Result<Self> {
        let size = rows.len();
        if rows.iter().any(|row| row.len() != size) {
            return Err(Error::InvalidKernel(format!(
                "kernel is not square: {} rows with lengths {:?}",
                size,
                rows.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        Self::from_flat(size, rows.iter().flatten().copied().collect())
    }

    /// Build a kernel from `size * size` weights in `[dk][dl]` order
    pub fn from_flat(size: usize, weights: Vec<f32>) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidKernel("kernel is empty".to_string()));
        }
        if size % 2 == 0 {
            return Err(Error::InvalidKernel(format!("kernel size {} is even", size)));
        }
        if weights.len() != size * size {
            return Err(Error::InvalidKernel(format!(
                "kernel of size {} needs {} weights, got {}",
                size,
                size * size,
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::InvalidKernel("kernel weights must be finite".to_string()));
        }
        Ok(Self { size, weights })
    }

    /// Side length of the matrix
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of neighbor rows sampled on each side of a pixel
    pub fn radius(&self) -> usize {
        self.size / 2
    }

    /// Weight at `[dk][dl]`
    #[inline]
    pub fn weight(&self, dk: usize, dl: usize) -> f32 {
        self.weights[dk * self.size + dl]
    }

    /// Flattened weights in `[dk][dl]` order
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Sum of all weights
    pub fn sum(&self) -> f32 {
        self.weights.iter().sum()
    }
}

/// Check that a multiplier is usable
pub fn validate_multiplier(multiplier: f32) -> Result<f32> {
    if multiplier.is_finite() {
        Ok(multiplier)
    } else {
        Err(Error::InvalidKernel(format!(
            "multiplier {} is not finite",
            multiplier
        )))
    }
}

/// A kernel registered under a name, with the multiplier it implies
#[derive(Debug, Clone)]
pub struct NamedKernel {
    /// Canonical name
    pub name: String,

    /// Numeric selector
    pub id: u32,

    /// Weights
    pub kernel: Kernel,

    /// Scalar applied after the weighted sum
    pub multiplier: f32,
}

/// Immutable lookup of named kernels
#[derive(Debug, Clone)]
pub struct KernelRegistry {
    entries: Arc<Vec<NamedKernel>>,
    by_name: Arc<BTreeMap<String, usize>>,
}

impl KernelRegistry {
    /// Build a registry from entries and `(alias, canonical name)` pairs
    pub fn new(entries: Vec<NamedKernel>, aliases: &[(&str, &str)]) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            validate_multiplier(entry.multiplier)?;
            if by_name.insert(entry.name.clone(), idx).is_some() {
                return Err(Error::Configuration(format!(
                    "kernel {} registered twice",
                    entry.name
                )));
            }
        }
        for (alias, target) in aliases {
            let idx = *by_name.get(*target).ok_or_else(|| {
                Error::Configuration(format!("alias {} points at unknown kernel {}", alias, target))
            })?;
            by_name.insert((*alias).to_string(), idx);
        }
        Ok(Self {
            entries: Arc::new(entries),
            by_name: Arc::new(by_name),
        })
    }

    /// Edge detection, sharpen, blur and emboss
    pub fn builtin() -> Self {
        let entries = vec![
            builtin_entry(
                "edge_detection",
                1,
                [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]],
                1.0,
            ),
            builtin_entry(
                "sharpen",
                2,
                [[0.0, -1.0, 0.0], [-1.0, 5.0, -1.0], [0.0, -1.0, 0.0]],
                1.0,
            ),
            builtin_entry(
                "blur",
                3,
                [[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]],
                1.0 / 9.0,
            ),
            builtin_entry(
                "emboss",
                4,
                [[-2.0, -1.0, 0.0], [-1.0, 1.0, 1.0], [0.0, 1.0, 2.0]],
                1.0,
            ),
        ];
        let aliases = [("box_blur", "blur"), ("edge", "edge_detection")];
        match Self::new(entries, &aliases) {
            Ok(registry) => registry,
            Err(e) => unreachable!("builtin kernel table is well formed: {}", e),
        }
    }

    /// Look up a kernel by name, alias or numeric id
    pub fn resolve(&self, selector: &str) -> Result<&NamedKernel> {
        let selector = selector.trim();
        if let Ok(id) = selector.parse::<u32>() {
            return self.entries.iter().find(|e| e.id == id).ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown kernel id {}; valid ids: {}",
                    id,
                    self.describe()
                ))
            });
        }
        let key = selector.to_lowercase().replace('-', "_");
        self.by_name
            .get(&key)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown kernel {:?}; valid kernels: {}",
                    selector,
                    self.describe()
                ))
            })
    }

    /// Registered entries in registration order
    pub fn entries(&self) -> &[NamedKernel] {
        &self.entries
    }

    fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}={}", e.id, e.name))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_entry(name: &str, id: u32, rows: [[f32; 3]; 3], multiplier: f32) -> NamedKernel {
    let weights = rows.iter().flatten().copied().collect();
    NamedKernel {
        name: name.to_string(),
        id,
        kernel: Kernel { size: 3, weights },
        multiplier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_validation() {
        assert!(Kernel::new(&[]).is_err());
        assert!(Kernel::new(&[vec![1.0, 0.0], vec![0.0, 1.0]]).is_err());
        assert!(Kernel::new(&[vec![1.0, 0.0, 0.0], vec![0.0], vec![0.0, 0.0, 0.0]]).is_err());
        assert!(Kernel::from_flat(3, vec![0.0; 8]).is_err());
        assert!(Kernel::from_flat(1, vec![f32::NAN]).is_err());

        let k = Kernel::new(&[
            vec![0.0, 1.0, 2.0],
            vec![3.0, 4.0, 5.0],
            vec![6.0, 7.0, 8.0],
        ])
        .unwrap();
        assert_eq!(k.size(), 3);
        assert_eq!(k.radius(), 1);
        assert_eq!(k.weight(1, 2), 5.0);
    }

    #[test]
    fn test_multiplier_must_be_finite() {
        assert!(validate_multiplier(0.5).is_ok());
        assert!(validate_multiplier(f32::INFINITY).is_err());
    }

    #[test]
    fn test_registry_resolves_names_ids_and_aliases() {
        let registry = KernelRegistry::builtin();

        let blur = registry.resolve("blur").unwrap();
        assert_eq!(blur.id, 3);
        assert!((blur.multiplier - 1.0 / 9.0).abs() < f32::EPSILON);

        assert_eq!(registry.resolve("box_blur").unwrap().name, "blur");
        assert_eq!(registry.resolve("2").unwrap().name, "sharpen");
        assert_eq!(registry.resolve("Edge-Detection").unwrap().id, 1);
        assert_eq!(registry.resolve("emboss").unwrap().kernel.sum(), 1.0);
    }

    #[test]
    fn test_registry_rejects_unknown_selectors() {
        let registry = KernelRegistry::builtin();
        assert!(matches!(registry.resolve("gaussian"), Err(Error::Configuration(_))));
        assert!(matches!(registry.resolve("9"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let k = Kernel::from_flat(1, vec![1.0]).unwrap();
        let entry = NamedKernel {
            name: "identity".into(),
            id: 1,
            kernel: k,
            multiplier: 1.0,
        };
        assert!(KernelRegistry::new(vec![entry.clone(), entry], &[]).is_err());
    }
}
