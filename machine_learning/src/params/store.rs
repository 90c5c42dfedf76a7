use std::mem;

use crate::{MlErr, Result, optimization::Optimizer};

/// Holds every trainable parameter of a model in a single flat buffer, together with a
/// gradient buffer of the same length.
///
/// Layers never own their parameters, they borrow contiguous slices of this buffer. The
/// slices are handed out sequentially through a `FrontIter` on forward passes and in
/// reverse through a `BackIter` on backward passes, so every layer must take exactly
/// its size in both directions.
#[derive(Debug, Clone)]
pub struct ParamStore {
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl ParamStore {
    /// Creates a new `ParamStore` filled with zeros.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters to hold.
    ///
    /// # Returns
    /// A new `ParamStore` instance.
    pub fn zeros(len: usize) -> Self {
        Self {
            params: vec![0.; len],
            grad: vec![0.; len],
        }
    }

    /// Creates a new `ParamStore` from existing parameter values, with a zeroed gradient.
    pub fn from_params(params: Vec<f32>) -> Self {
        let grad = vec![0.; params.len()];
        Self { params, grad }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    /// Overwrites every parameter with `values`.
    ///
    /// # Errors
    /// Returns `MlErr::SizeMismatch` if `values` doesn't have exactly `len` elements.
    pub fn set_params(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameter buffer",
                got: values.len(),
                expected: self.params.len(),
            });
        }

        self.params.copy_from_slice(values);
        Ok(())
    }

    /// Resets the gradient buffer, should be called before every backward pass.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    /// Creates an iterator that yields read-only parameter slices from the start of the buffer.
    pub fn front(&self) -> FrontIter<'_> {
        FrontIter { rest: &self.params }
    }

    /// Creates an iterator that yields mutable parameter slices from the start of the buffer.
    ///
    /// Used for initializing and loading parameters.
    pub fn front_mut(&mut self) -> FrontIterMut<'_> {
        FrontIterMut {
            rest: &mut self.params,
        }
    }

    /// Creates an iterator that yields `(params, grad)` slice pairs from the end of the buffers.
    pub fn back(&mut self) -> BackIter<'_> {
        BackIter {
            params: &self.params,
            grad: &mut self.grad,
        }
    }

    /// Applies a single optimization step using the accumulated gradient.
    ///
    /// # Arguments
    /// * `optimizer` - The optimization algorithm.
    pub fn optimize<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<()> {
        optimizer.update_params(&self.grad, &mut self.params)
    }
}

/// The forward parameter iterator.
pub struct FrontIter<'pm> {
    rest: &'pm [f32],
}

impl<'pm> FrontIter<'pm> {
    /// Takes the next `n` parameters.
    ///
    /// # Errors
    /// Returns `MlErr::ParamsExhausted` if there are less than `n` parameters left.
    pub fn take(&mut self, n: usize) -> Result<&'pm [f32]> {
        if n > self.rest.len() {
            return Err(MlErr::ParamsExhausted {
                requested: n,
                remaining: self.rest.len(),
            });
        }

        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// The mutable forward parameter iterator.
pub struct FrontIterMut<'pm> {
    rest: &'pm mut [f32],
}

impl<'pm> FrontIterMut<'pm> {
    /// Creates a `FrontIterMut` over an arbitrary buffer.
    pub fn new(buf: &'pm mut [f32]) -> Self {
        Self { rest: buf }
    }

    /// Takes the next `n` parameters.
    ///
    /// # Errors
    /// Returns `MlErr::ParamsExhausted` if there are less than `n` parameters left.
    pub fn take(&mut self, n: usize) -> Result<&'pm mut [f32]> {
        if n > self.rest.len() {
            return Err(MlErr::ParamsExhausted {
                requested: n,
                remaining: self.rest.len(),
            });
        }

        let rest = mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(n);
        self.rest = tail;
        Ok(head)
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// The reversed parameter iterator, yields the parameters along with their gradient.
pub struct BackIter<'pm> {
    params: &'pm [f32],
    grad: &'pm mut [f32],
}

impl<'pm> BackIter<'pm> {
    /// Takes the last `n` parameters and their gradient.
    ///
    /// # Errors
    /// Returns `MlErr::ParamsExhausted` if there are less than `n` parameters left.
    pub fn take(&mut self, n: usize) -> Result<(&'pm [f32], &'pm mut [f32])> {
        let len = self.params.len();

        if n > len {
            return Err(MlErr::ParamsExhausted {
                requested: n,
                remaining: len,
            });
        }

        let (params_head, params_tail) = self.params.split_at(len - n);
        let grad = mem::take(&mut self.grad);
        let (grad_head, grad_tail) = grad.split_at_mut(len - n);

        self.params = params_head;
        self.grad = grad_head;
        Ok((params_tail, grad_tail))
    }

    pub fn remaining(&self) -> usize {
        self.params.len()
    }
}
