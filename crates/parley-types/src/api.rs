use serde::{Deserialize, Serialize};

/// JWT claims verified at socket upgrade. Token issuance and refresh are
/// owned by the external auth service; this subsystem only decodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub exp: usize,
}
