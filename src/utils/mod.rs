//! Utility functions shared by the engines.

pub mod matrix_convert;

pub use matrix_convert::{
    nalgebra_to_ndarray, nalgebra_vec_to_ndarray, ndarray_to_nalgebra, ndarray_vec_to_nalgebra,
    solve_cholesky, solve_lu,
};
