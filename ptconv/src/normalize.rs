//! Force every tensor into a row-major layout before serialization.

use tracing::debug;

use crate::tensor::TensorMap;

/// Replace every non-contiguous tensor with a contiguous copy.
///
/// Returns the normalized map together with the number of tensors that had
/// to be copied.
pub fn make_contiguous(tensors: TensorMap) -> (TensorMap, usize) {
    let mut copied = 0;
    let mut out = TensorMap::new();
    for (name, tensor) in tensors {
        if tensor.is_contiguous() {
            out.insert(name, tensor);
        } else {
            debug!(name = %name, shape = ?tensor.shape(), strides = ?tensor.strides(), "copying to contiguous layout");
            copied += 1;
            out.insert(name, tensor.contiguous());
        }
    }
    (out, copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{contiguous_strides, Dtype, Tensor};
    use proptest::prelude::*;
    use rand::seq::SliceRandom;

    fn arange(shape: Vec<usize>) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<i32> = (0..n as i32).collect();
        Tensor::from_slice(Dtype::I32, shape, &data).unwrap()
    }

    /// Permuted view of a fresh tensor, like `tensor.permute(perm)`.
    fn permuted(base: &Tensor, perm: &[usize]) -> Tensor {
        let shape = perm.iter().map(|&p| base.shape()[p]).collect();
        let strides = perm.iter().map(|&p| base.strides()[p]).collect();
        base.as_strided(shape, strides, 0).unwrap()
    }

    #[test]
    fn test_only_strided_tensors_are_copied() {
        let base = arange(vec![3, 4]);
        let mut map = TensorMap::new();
        map.insert("plain", base.clone());
        map.insert("t", base.transpose(0, 1).unwrap());

        let (out, copied) = make_contiguous(map);
        assert_eq!(copied, 1);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["plain", "t"]);
        assert!(out.get("plain").unwrap().shares_storage(&base));

        let t = out.get("t").unwrap();
        assert!(t.is_contiguous());
        assert_eq!(t.strides(), contiguous_strides(&[4, 3]).as_slice());
    }

    #[test]
    fn test_random_permutations_preserve_values() {
        let mut rng = rand::thread_rng();
        let base = arange(vec![2, 3, 4, 5]);
        for _ in 0..16 {
            let mut perm = vec![0, 1, 2, 3];
            perm.shuffle(&mut rng);
            let view = permuted(&base, &perm);

            let mut map = TensorMap::new();
            map.insert("v", view.clone());
            let (out, _) = make_contiguous(map);
            let normalized = out.get("v").unwrap();
            assert!(normalized.is_contiguous());
            assert!(normalized.equal(&view), "permutation {perm:?} changed contents");
        }
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(
            dims in proptest::collection::vec(1usize..4, 1..4),
            reverse in any::<bool>(),
        ) {
            let base = arange(dims.clone());
            let mut perm: Vec<usize> = (0..dims.len()).collect();
            if reverse {
                perm.reverse();
            }
            let mut map = TensorMap::new();
            map.insert("x", permuted(&base, &perm));

            let (once, _) = make_contiguous(map);
            let (twice, copied_again) = make_contiguous(once.clone());

            prop_assert_eq!(copied_again, 0);
            let a = once.get("x").unwrap();
            let b = twice.get("x").unwrap();
            prop_assert!(a.is_contiguous());
            prop_assert!(a.equal(b));
            prop_assert!(a.shares_storage(b));
        }
    }
}
