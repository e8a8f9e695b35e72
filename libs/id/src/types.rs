//! Typed ID definitions for coordinator resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Workers and Coordinators
// =============================================================================

define_id!(WorkerId, "wkr");
define_id!(CoordinatorId, "crd");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
