use crate::distributed::{Mesh, ShardingRules, MESH_AXIS};
use crate::error::{Error, Result};
use crate::precision::DType;
use serde::{Deserialize, Serialize};

/// Architecture, precision, sharding and optimizer hyperparameters.
///
/// Built once at startup and passed by reference everywhere. The mesh is not serialized; a config
/// read back from JSON (or from a checkpoint) is bound to a single host device until
/// [`Config::with_mesh`] is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub d_model: usize,
    pub ffw_multiplier: usize,
    pub query_heads: usize,
    pub key_heads: usize,
    pub num_layers: usize,
    pub key_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub causal: bool,
    /// Use the flash kernel in training. Incompatible with a KV cache.
    pub use_attn_kernel: bool,
    pub weight_dtype: DType,
    pub activation_dtype: DType,
    pub rules: ShardingRules,
    #[serde(skip, default)]
    pub mesh: Mesh,

    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl Config {
    /// The small configuration used by the demos and most tests: one layer of width 256 with FSDP
    /// rules over `mesh`.
    pub fn tiny(mesh: Mesh) -> Self {
        Self {
            d_model: 256,
            ffw_multiplier: 4,
            query_heads: 4,
            key_heads: 4,
            num_layers: 1,
            key_dim: 64,
            vocab_size: 1000,
            max_seq_len: 1024,
            causal: true,
            use_attn_kernel: true,
            weight_dtype: DType::F32,
            activation_dtype: DType::F32,
            rules: ShardingRules::fsdp(MESH_AXIS),
            mesh,
            max_lr: 3e-4,
            min_lr: 1e-5,
            warmup_steps: 50,
            total_steps: 10_000,
        }
    }

    /// Hidden width of the feed-forward sublayer.
    pub fn ffw_dim(&self) -> usize {
        self.d_model * self.ffw_multiplier
    }

    /// Query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.query_heads / self.key_heads
    }

    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_rules(mut self, rules: ShardingRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_attn_kernel(mut self, use_attn_kernel: bool) -> Self {
        self.use_attn_kernel = use_attn_kernel;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_dtypes(mut self, weight_dtype: DType, activation_dtype: DType) -> Self {
        self.weight_dtype = weight_dtype;
        self.activation_dtype = activation_dtype;
        self
    }

    pub fn with_schedule(
        mut self,
        max_lr: f32,
        min_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Self {
        self.max_lr = max_lr;
        self.min_lr = min_lr;
        self.warmup_steps = warmup_steps;
        self.total_steps = total_steps;
        self
    }

    /// Overrides the model dimensions, keeping precision, rules, mesh and schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn with_dims(
        mut self,
        d_model: usize,
        ffw_multiplier: usize,
        query_heads: usize,
        key_heads: usize,
        num_layers: usize,
        key_dim: usize,
        vocab_size: usize,
        max_seq_len: usize,
    ) -> Self {
        self.d_model = d_model;
        self.ffw_multiplier = ffw_multiplier;
        self.query_heads = query_heads;
        self.key_heads = key_heads;
        self.num_layers = num_layers;
        self.key_dim = key_dim;
        self.vocab_size = vocab_size;
        self.max_seq_len = max_seq_len;
        self
    }

    /// Rejects configurations no component can run with.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("d_model", self.d_model),
            ("ffw_multiplier", self.ffw_multiplier),
            ("query_heads", self.query_heads),
            ("key_heads", self.key_heads),
            ("num_layers", self.num_layers),
            ("key_dim", self.key_dim),
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.key_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "key_dim must be even for rotary embeddings, got {}",
                self.key_dim
            )));
        }
        if self.query_heads % self.key_heads != 0 {
            return Err(Error::Config(format!(
                "query_heads ({}) must be a multiple of key_heads ({})",
                self.query_heads, self.key_heads
            )));
        }
        if self.total_steps <= self.warmup_steps {
            return Err(Error::Config(format!(
                "total_steps ({}) must exceed warmup_steps ({})",
                self.total_steps, self.warmup_steps
            )));
        }
        if self.min_lr > self.max_lr {
            return Err(Error::Config(format!(
                "min_lr ({}) exceeds max_lr ({})",
                self.min_lr, self.max_lr
            )));
        }
        self.rules.validate(&self.mesh)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{create_mesh, HostDevices};

    #[test]
    fn test_tiny_is_valid() {
        let cfg = Config::tiny(Mesh::single_host());
        cfg.validate().unwrap();
        assert_eq!(cfg.ffw_dim(), 1024);
        assert_eq!(cfg.group_size(), 1);
    }

    #[test]
    fn test_validate_rejects() {
        let base = Config::tiny(Mesh::single_host());

        let mut cfg = base.clone();
        cfg.key_dim = 63;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = base.clone();
        cfg.query_heads = 6;
        assert!(cfg.validate().is_err());

        let cfg = base.clone().with_schedule(3e-4, 1e-5, 100, 100);
        assert!(cfg.validate().is_err());

        let cfg = base.clone().with_schedule(1e-5, 3e-4, 10, 100);
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.vocab_size = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("vocab_size"));

        let cfg = base.with_rules(ShardingRules::fsdp("y"));
        assert!(matches!(cfg.validate(), Err(Error::UnknownMeshAxis(_))));
    }

    #[test]
    fn test_json_round_trip_drops_mesh() {
        let mesh = create_mesh(&HostDevices::new(4)).unwrap();
        let cfg = Config::tiny(mesh).with_dtypes(DType::Bf16, DType::Bf16);
        let back = Config::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back.mesh.size(), 1);
        assert_eq!(back.weight_dtype, DType::Bf16);
        assert_eq!(back.rules, cfg.rules);
        assert_eq!(back.with_mesh(cfg.mesh.clone()), cfg);
    }
}
