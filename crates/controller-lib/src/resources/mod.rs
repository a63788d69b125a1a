//! Resource model and compliance comparison
//!
//! This module provides:
//! - Quantity parsing with unit normalization (milli-CPU, bytes)
//! - Requests/limits specs and their wire form
//! - Field-by-field comparison of actual vs desired resources

mod compare;
mod quantity;
mod spec;

pub use compare::{compare, Comparator, ComparatorConfig, Comparison, FieldDiff};
pub use quantity::{Quantity, QuantityError, ResourceKind};
pub use spec::{ParseError, ResourceField, ResourceList, ResourceRequirements, ResourceSpec};
