//! The parameter tree.
//!
//! [`Weights`] and [`Layer`] are generic over their leaf so the same structure carries every
//! per-parameter quantity the model needs:
//!
//! | Leaf | Meaning |
//! |---|---|
//! | [`ParamSpec`] | shape, logical axes, initializer and dtype, without values |
//! | [`NamedSharding`] | where each parameter lives on the mesh |
//! | [`ShardedTensor`] | parameters, gradients and optimizer moments |
//! | `f32` | per-parameter scalars such as gradient norms |
//!
//! Leaves are addressed by dotted paths (`layers.0.q`, `embedding`), which also key the
//! per-parameter random streams and the checkpoint entries.

use crate::config::Config;
use crate::distributed::{logical_to_sharding, LogicalAxis, NamedSharding, Shardable, ShardedTensor};
use crate::error::{Error, Result};
use crate::precision::DType;
use crate::tensor::Tensor;

/// How a parameter's initial values are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    /// Truncated He normal; fan-in is the product of the `in_axes` dimensions.
    HeNormal { in_axes: Vec<usize> },
    Ones,
}

/// A parameter before it has values: the abstract half of two-phase initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub shape: Vec<usize>,
    pub axes: Vec<LogicalAxis>,
    pub init: Initializer,
    pub dtype: DType,
}

impl ParamSpec {
    fn new(shape: Vec<usize>, axes: Vec<LogicalAxis>, init: Initializer, dtype: DType) -> Self {
        Self {
            shape,
            axes,
            init,
            dtype,
        }
    }

    /// `in_axes` are the axes the parameter contracts over in the forward pass, so `w2 [ffw, d]`
    /// takes its fan-in from `ffw`.
    fn he_normal(shape: Vec<usize>, axes: Vec<LogicalAxis>, in_axes: &[usize], dtype: DType) -> Self {
        let init = Initializer::HeNormal {
            in_axes: in_axes.to_vec(),
        };
        Self::new(shape, axes, init, dtype)
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Resolves this parameter's logical axes to a sharding under the config's rules.
    pub fn sharding(&self, cfg: &Config) -> Result<NamedSharding> {
        logical_to_sharding(&self.axes, &self.shape, &cfg.rules, &cfg.mesh)
    }
}

/// One transformer block's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer<P> {
    /// `[d_model, query_heads, key_dim]`
    pub q: P,
    /// `[d_model, key_heads, key_dim]`
    pub k: P,
    /// `[d_model, key_heads, key_dim]`
    pub v: P,
    /// `[query_heads, key_dim, d_model]`
    pub proj: P,
    /// `[d_model, ffw]`
    pub w1: P,
    /// `[ffw, d_model]`
    pub w2: P,
    /// `[d_model]`, before attention
    pub gamma1: P,
    /// `[d_model]`, before the feed-forward sublayer
    pub gamma2: P,
}

impl<P> Layer<P> {
    pub const FIELDS: [&'static str; 8] = ["q", "k", "v", "proj", "w1", "w2", "gamma1", "gamma2"];

    /// Leaves in [`Layer::FIELDS`] order.
    pub fn leaves(&self) -> [&P; 8] {
        let Layer {
            q,
            k,
            v,
            proj,
            w1,
            w2,
            gamma1,
            gamma2,
        } = self;
        [q, k, v, proj, w1, w2, gamma1, gamma2]
    }

    pub fn leaves_mut(&mut self) -> [&mut P; 8] {
        let Layer {
            q,
            k,
            v,
            proj,
            w1,
            w2,
            gamma1,
            gamma2,
        } = self;
        [q, k, v, proj, w1, w2, gamma1, gamma2]
    }

    fn try_map_named<Q, F>(&self, prefix: &str, f: &mut F) -> Result<Layer<Q>>
    where
        F: FnMut(&str, &P) -> Result<Q>,
    {
        let path = |field: &str| format!("{prefix}.{field}");
        Ok(Layer {
            q: f(&path("q"), &self.q)?,
            k: f(&path("k"), &self.k)?,
            v: f(&path("v"), &self.v)?,
            proj: f(&path("proj"), &self.proj)?,
            w1: f(&path("w1"), &self.w1)?,
            w2: f(&path("w2"), &self.w2)?,
            gamma1: f(&path("gamma1"), &self.gamma1)?,
            gamma2: f(&path("gamma2"), &self.gamma2)?,
        })
    }

    fn try_zip_map_named<R, Q, F>(&self, other: &Layer<R>, prefix: &str, f: &mut F) -> Result<Layer<Q>>
    where
        F: FnMut(&str, &P, &R) -> Result<Q>,
    {
        let path = |field: &str| format!("{prefix}.{field}");
        Ok(Layer {
            q: f(&path("q"), &self.q, &other.q)?,
            k: f(&path("k"), &self.k, &other.k)?,
            v: f(&path("v"), &self.v, &other.v)?,
            proj: f(&path("proj"), &self.proj, &other.proj)?,
            w1: f(&path("w1"), &self.w1, &other.w1)?,
            w2: f(&path("w2"), &self.w2, &other.w2)?,
            gamma1: f(&path("gamma1"), &self.gamma1, &other.gamma1)?,
            gamma2: f(&path("gamma2"), &self.gamma2, &other.gamma2)?,
        })
    }
}

/// The whole model: a stack of layers plus the token embedding and the output projection.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights<P> {
    pub layers: Vec<Layer<P>>,
    /// `[vocab, d_model]`
    pub embedding: P,
    /// `[d_model, vocab]`
    pub vocab_proj: P,
}

impl<P> Weights<P> {
    /// Applies `f` to every leaf along with its path.
    pub fn try_map<Q, F>(&self, mut f: F) -> Result<Weights<Q>>
    where
        F: FnMut(&str, &P) -> Result<Q>,
    {
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| layer.try_map_named(&format!("layers.{i}"), &mut f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Weights {
            layers,
            embedding: f("embedding", &self.embedding)?,
            vocab_proj: f("vocab_proj", &self.vocab_proj)?,
        })
    }

    pub fn map<Q, F>(&self, mut f: F) -> Weights<Q>
    where
        F: FnMut(&P) -> Q,
    {
        Weights {
            layers: self
                .layers
                .iter()
                .map(|l| Layer {
                    q: f(&l.q),
                    k: f(&l.k),
                    v: f(&l.v),
                    proj: f(&l.proj),
                    w1: f(&l.w1),
                    w2: f(&l.w2),
                    gamma1: f(&l.gamma1),
                    gamma2: f(&l.gamma2),
                })
                .collect(),
            embedding: f(&self.embedding),
            vocab_proj: f(&self.vocab_proj),
        }
    }

    /// Pairs each leaf with the corresponding leaf of `other`.
    ///
    /// # Errors
    ///
    /// Fails if the trees have different depths, or if `f` fails.
    pub fn try_zip_map<R, Q, F>(&self, other: &Weights<R>, mut f: F) -> Result<Weights<Q>>
    where
        F: FnMut(&str, &P, &R) -> Result<Q>,
    {
        if self.layers.len() != other.layers.len() {
            return Err(Error::Config(format!(
                "parameter trees have {} and {} layers",
                self.layers.len(),
                other.layers.len()
            )));
        }
        let layers = self
            .layers
            .iter()
            .zip(&other.layers)
            .enumerate()
            .map(|(i, (a, b))| a.try_zip_map_named(b, &format!("layers.{i}"), &mut f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Weights {
            layers,
            embedding: f("embedding", &self.embedding, &other.embedding)?,
            vocab_proj: f("vocab_proj", &self.vocab_proj, &other.vocab_proj)?,
        })
    }

    /// Every leaf with its path, layers first.
    pub fn leaves(&self) -> Vec<(String, &P)> {
        let mut out = Vec::with_capacity(self.layers.len() * 8 + 2);
        for (i, layer) in self.layers.iter().enumerate() {
            for (field, leaf) in Layer::<P>::FIELDS.iter().zip(layer.leaves()) {
                out.push((format!("layers.{i}.{field}"), leaf));
            }
        }
        out.push(("embedding".to_string(), &self.embedding));
        out.push(("vocab_proj".to_string(), &self.vocab_proj));
        out
    }

    /// Every leaf, mutably, in the same order as [`Weights::leaves`].
    pub fn leaves_mut(&mut self) -> Vec<&mut P> {
        let mut out = Vec::with_capacity(self.layers.len() * 8 + 2);
        for layer in &mut self.layers {
            out.extend(layer.leaves_mut());
        }
        out.push(&mut self.embedding);
        out.push(&mut self.vocab_proj);
        out
    }
}

impl Weights<ParamSpec> {
    /// Shapes, logical axes and initializers of every parameter, without allocating any values.
    pub fn abstract_spec(cfg: &Config) -> Self {
        use LogicalAxis::*;
        let (d, hq, hk, kd, f, vocab) = (
            cfg.d_model,
            cfg.query_heads,
            cfg.key_heads,
            cfg.key_dim,
            cfg.ffw_dim(),
            cfg.vocab_size,
        );
        let dt = cfg.weight_dtype;

        let layer = || Layer {
            q: ParamSpec::he_normal(vec![d, hq, kd], vec![DModel, QueryHeads, KeyDim], &[0], dt),
            k: ParamSpec::he_normal(vec![d, hk, kd], vec![DModel, KeyHeads, KeyDim], &[0], dt),
            v: ParamSpec::he_normal(vec![d, hk, kd], vec![DModel, KeyHeads, KeyDim], &[0], dt),
            proj: ParamSpec::he_normal(vec![hq, kd, d], vec![QueryHeads, KeyDim, DModel], &[0, 1], dt),
            w1: ParamSpec::he_normal(vec![d, f], vec![DModel, Ffw], &[0], dt),
            w2: ParamSpec::he_normal(vec![f, d], vec![Ffw, DModel], &[0], dt),
            gamma1: ParamSpec::new(vec![d], vec![DModel], Initializer::Ones, dt),
            gamma2: ParamSpec::new(vec![d], vec![DModel], Initializer::Ones, dt),
        };

        Weights {
            layers: (0..cfg.num_layers).map(|_| layer()).collect(),
            embedding: ParamSpec::he_normal(vec![vocab, d], vec![Vocab, DModel], &[0], dt),
            vocab_proj: ParamSpec::he_normal(vec![d, vocab], vec![DModel, Vocab], &[0], dt),
        }
    }

    /// Target placement of every parameter.
    pub fn shardings(&self, cfg: &Config) -> Result<Weights<NamedSharding>> {
        self.try_map(|_, spec| spec.sharding(cfg))
    }

    pub fn num_params(&self) -> usize {
        self.leaves().iter().map(|(_, spec)| spec.size()).sum()
    }
}

impl Weights<ShardedTensor> {
    /// Gradient norms, one per leaf.
    pub fn l2_norms(&self) -> Weights<f32> {
        self.map(ShardedTensor::l2_norm)
    }

    /// Gathers the embedding table.
    pub fn gather_embedding(&self) -> Result<Tensor<f32, 2>> {
        self.embedding.gather()
    }

    /// Gathers the output projection.
    pub fn gather_vocab_proj(&self) -> Result<Tensor<f32, 2>> {
        self.vocab_proj.gather()
    }
}

/// One layer gathered in full, at its compute ranks.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub q: Tensor<f32, 3>,
    pub k: Tensor<f32, 3>,
    pub v: Tensor<f32, 3>,
    pub proj: Tensor<f32, 3>,
    pub w1: Tensor<f32, 2>,
    pub w2: Tensor<f32, 2>,
    pub gamma1: Tensor<f32, 1>,
    pub gamma2: Tensor<f32, 1>,
}

impl DenseLayer {
    /// Reduce-scatters full per-layer gradients onto the layout of `like`.
    pub fn scatter_like(self, like: &Layer<ShardedTensor>) -> Result<Layer<ShardedTensor>> {
        let grad = |t: &ShardedTensor, data: &[f32]| t.scatter_like(data, DType::F32);
        Ok(Layer {
            q: grad(&like.q, self.q.data())?,
            k: grad(&like.k, self.k.data())?,
            v: grad(&like.v, self.v.data())?,
            proj: grad(&like.proj, self.proj.data())?,
            w1: grad(&like.w1, self.w1.data())?,
            w2: grad(&like.w2, self.w2.data())?,
            gamma1: grad(&like.gamma1, self.gamma1.data())?,
            gamma2: grad(&like.gamma2, self.gamma2.data())?,
        })
    }
}

impl Shardable for Layer<ShardedTensor> {
    type Full = DenseLayer;

    fn gather(&self) -> Result<DenseLayer> {
        Ok(DenseLayer {
            q: self.q.gather()?,
            k: self.k.gather()?,
            v: self.v.gather()?,
            proj: self.proj.gather()?,
            w1: self.w1.gather()?,
            w2: self.w2.gather()?,
            gamma1: self.gamma1.gather()?,
            gamma2: self.gamma2.gather()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{create_mesh, HostDevices, ShardingRules, MESH_AXIS};

    #[test]
    fn test_abstract_shapes() {
        let cfg = Config::tiny(Default::default());
        let spec = Weights::abstract_spec(&cfg);
        assert_eq!(spec.layers.len(), 1);
        assert_eq!(spec.layers[0].q.shape, vec![256, 4, 64]);
        assert_eq!(spec.layers[0].w2.shape, vec![1024, 256]);
        assert_eq!(spec.embedding.shape, vec![1000, 256]);
        assert_eq!(spec.layers[0].gamma1.init, Initializer::Ones);
        assert_eq!(
            spec.layers[0].proj.init,
            Initializer::HeNormal {
                in_axes: vec![0, 1]
            }
        );
    }

    #[test]
    fn test_fan_in_follows_contraction_axis() {
        let cfg = Config::tiny(Default::default());
        let spec = Weights::abstract_spec(&cfg);
        let fan_in = |p: &ParamSpec| match &p.init {
            Initializer::HeNormal { in_axes } => in_axes.iter().map(|&a| p.shape[a]).product(),
            Initializer::Ones => 0usize,
        };
        let layer = &spec.layers[0];
        assert_eq!(fan_in(&layer.q), cfg.d_model);
        assert_eq!(fan_in(&layer.proj), cfg.query_heads * cfg.key_dim);
        assert_eq!(fan_in(&layer.w1), cfg.d_model);
        assert_eq!(fan_in(&layer.w2), cfg.ffw_dim());
        assert_eq!(fan_in(&spec.vocab_proj), cfg.d_model);
    }

    #[test]
    fn test_leaf_paths() {
        let mut cfg = Config::tiny(Default::default());
        cfg.num_layers = 2;
        let spec = Weights::abstract_spec(&cfg);
        let paths: Vec<String> = spec.leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths.len(), 18);
        assert_eq!(paths[0], "layers.0.q");
        assert_eq!(paths[15], "layers.1.gamma2");
        assert_eq!(paths[17], "vocab_proj");

        let mapped = spec.try_map(|path, _| Ok(path.to_string())).unwrap();
        assert_eq!(mapped.layers[1].w1, "layers.1.w1");
    }

    #[test]
    fn test_zip_map_rejects_depth_mismatch() {
        let cfg = Config::tiny(Default::default());
        let a = Weights::abstract_spec(&cfg);
        let mut b = a.clone();
        b.layers.clear();
        assert!(a.try_zip_map(&b, |_, _, _| Ok(())).is_err());
    }

    #[test]
    fn test_shardings_resolve_under_both_presets() {
        let mesh = create_mesh(&HostDevices::new(4)).unwrap();
        for rules in [
            ShardingRules::fsdp(MESH_AXIS),
            ShardingRules::model_parallel(MESH_AXIS),
        ] {
            let cfg = Config::tiny(mesh.clone()).with_rules(rules.clone());
            let spec = Weights::abstract_spec(&cfg);
            let shardings = spec.shardings(&cfg).unwrap();
            for ((_, s), (_, sh)) in spec.leaves().into_iter().zip(shardings.leaves()) {
                assert_eq!(sh.spec().len(), s.shape.len());
                for (dim, axis) in s.axes.iter().enumerate() {
                    assert_eq!(sh.spec().get(dim), rules.get(*axis));
                }
            }
        }
    }
}
