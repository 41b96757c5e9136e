//! Policy parameter store and frozen reference-model construction.
//!
//! A reference model never owns mutable access to anything. Layers inside the
//! shared prefix are bindings into the policy's layer store (by index, with the
//! layer name and width recorded so drift is detectable); the remaining layers
//! are owned copies taken at build time. Reading a shared layer requires a
//! borrow of the policy, so a reference read can never overlap a policy write.

use prefopt_types::{EngineError, EngineResult, ParameterLayer};

/// Trainable policy parameters, ordered from input to output.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyParameters {
    layers: Vec<ParameterLayer>,
    version: u64,
}

impl PolicyParameters {
    pub fn new(layers: Vec<ParameterLayer>) -> EngineResult<Self> {
        validate_layers(&layers)?;
        Ok(Self { layers, version: 0 })
    }

    pub fn layers(&self) -> &[ParameterLayer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&ParameterLayer> {
        self.layers.get(index)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Incremented by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(ParameterLayer::len).sum()
    }

    /// Adds `delta` element-wise to one layer.
    pub fn apply_update(&mut self, layer_index: usize, delta: &[f64]) -> EngineResult<()> {
        let layer_count = self.layers.len();
        let layer = self.layers.get_mut(layer_index).ok_or_else(|| {
            EngineError::invalid_input(format!(
                "policy update targets layer {layer_index} but policy has {layer_count} layers"
            ))
        })?;
        if layer.values.len() != delta.len() {
            return Err(EngineError::invalid_input(format!(
                "policy update for layer '{}' has width {}, expected {}",
                layer.name,
                delta.len(),
                layer.values.len()
            )));
        }
        if delta.iter().any(|value| !value.is_finite()) {
            return Err(EngineError::invalid_input(format!(
                "policy update for layer '{}' contains non-finite values",
                layer.name
            )));
        }

        for (value, step) in layer.values.iter_mut().zip(delta) {
            *value += step;
        }
        self.version += 1;
        Ok(())
    }

    /// Replaces the whole layer stack, e.g. after an architecture change.
    ///
    /// Reference models built earlier must be rebound afterwards.
    pub fn replace_layers(&mut self, layers: Vec<ParameterLayer>) -> EngineResult<()> {
        validate_layers(&layers)?;
        self.layers = layers;
        self.version += 1;
        Ok(())
    }
}

/// Where a reference layer's values come from.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerBinding {
    /// Live alias of a policy layer.
    Shared {
        policy_layer: usize,
        name: String,
        width: usize,
    },
    /// Independent copy frozen at construction time.
    Frozen(ParameterLayer),
}

/// Frozen (or partially shared) comparison model.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceModel {
    bindings: Vec<LayerBinding>,
    shared_prefix_layer_count: usize,
}

/// Resolved layer stack of a reference model at one synchronization point.
#[derive(Debug, Clone)]
pub struct ReferenceView<'a> {
    layers: Vec<&'a ParameterLayer>,
}

impl<'a> ReferenceView<'a> {
    pub fn layers(&self) -> &[&'a ParameterLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Builds a reference model from the current policy.
///
/// With `shared_prefix_layer_count == 0` every layer is deep-copied. Otherwise
/// the first `shared_prefix_layer_count` layers alias the policy and the rest
/// are frozen copies.
#[tracing::instrument(level = "debug", skip(policy), fields(policy_layers = policy.layer_count()))]
pub fn build_reference_model(
    policy: &PolicyParameters,
    shared_prefix_layer_count: usize,
) -> EngineResult<ReferenceModel> {
    if shared_prefix_layer_count > policy.layer_count() {
        return Err(EngineError::configuration(format!(
            "shared_prefix_layer_count {shared_prefix_layer_count} exceeds policy layer count {}",
            policy.layer_count()
        )));
    }

    let bindings = policy
        .layers()
        .iter()
        .enumerate()
        .map(|(index, layer)| {
            if index < shared_prefix_layer_count {
                LayerBinding::Shared {
                    policy_layer: index,
                    name: layer.name.clone(),
                    width: layer.len(),
                }
            } else {
                LayerBinding::Frozen(layer.clone())
            }
        })
        .collect();

    Ok(ReferenceModel {
        bindings,
        shared_prefix_layer_count,
    })
}

impl ReferenceModel {
    pub fn shared_prefix_layer_count(&self) -> usize {
        self.shared_prefix_layer_count
    }

    pub fn layer_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn bindings(&self) -> &[LayerBinding] {
        &self.bindings
    }

    pub fn is_shared(&self, index: usize) -> bool {
        matches!(self.bindings.get(index), Some(LayerBinding::Shared { .. }))
    }

    /// Reads one reference layer, following shared bindings into `policy`.
    pub fn layer<'a>(
        &'a self,
        policy: &'a PolicyParameters,
        index: usize,
    ) -> EngineResult<&'a ParameterLayer> {
        let binding = self.bindings.get(index).ok_or_else(|| {
            EngineError::invalid_input(format!(
                "reference layer {index} out of range ({} layers)",
                self.bindings.len()
            ))
        })?;
        match binding {
            LayerBinding::Frozen(layer) => Ok(layer),
            LayerBinding::Shared {
                policy_layer,
                name,
                width,
            } => {
                let layer = policy.layer(*policy_layer).ok_or_else(|| {
                    EngineError::configuration(format!(
                        "shared reference layer '{name}' points at missing policy layer {policy_layer}"
                    ))
                })?;
                if layer.name != *name || layer.len() != *width {
                    return Err(EngineError::configuration(format!(
                        "shared reference layer '{name}' no longer matches policy layer {policy_layer} ('{}', width {}); rebind the reference model",
                        layer.name,
                        layer.len()
                    )));
                }
                Ok(layer)
            }
        }
    }

    /// Resolves every layer against the policy's current values.
    pub fn resolve<'a>(&'a self, policy: &'a PolicyParameters) -> EngineResult<ReferenceView<'a>> {
        let layers = (0..self.bindings.len())
            .map(|index| self.layer(policy, index))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(ReferenceView { layers })
    }

    /// Fails if any shared binding has drifted from the policy's structure.
    pub fn ensure_compatible(&self, policy: &PolicyParameters) -> EngineResult<()> {
        self.resolve(policy).map(|_| ())
    }

    /// Recomputes shared bindings by layer name after the policy was restructured.
    ///
    /// Frozen layers are kept as they are.
    #[tracing::instrument(level = "debug", skip(self, policy))]
    pub fn rebind(&mut self, policy: &PolicyParameters) -> EngineResult<()> {
        let mut rebound = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            match binding {
                LayerBinding::Frozen(layer) => rebound.push(LayerBinding::Frozen(layer.clone())),
                LayerBinding::Shared { name, .. } => {
                    let (index, layer) = policy
                        .layers()
                        .iter()
                        .enumerate()
                        .find(|(_, layer)| layer.name == *name)
                        .ok_or_else(|| {
                            EngineError::configuration(format!(
                                "cannot rebind shared reference layer '{name}': policy has no layer with that name"
                            ))
                        })?;
                    rebound.push(LayerBinding::Shared {
                        policy_layer: index,
                        name: name.clone(),
                        width: layer.len(),
                    });
                }
            }
        }
        self.bindings = rebound;
        tracing::debug!(
            shared = self.shared_prefix_layer_count,
            "rebound shared reference layers"
        );
        Ok(())
    }

    /// Parameters read through shared bindings (not duplicated in memory).
    pub fn shared_parameter_count(&self) -> usize {
        self.bindings
            .iter()
            .map(|binding| match binding {
                LayerBinding::Shared { width, .. } => *width,
                LayerBinding::Frozen(_) => 0,
            })
            .sum()
    }

    /// Parameters held as independent frozen copies.
    pub fn owned_parameter_count(&self) -> usize {
        self.bindings
            .iter()
            .map(|binding| match binding {
                LayerBinding::Shared { .. } => 0,
                LayerBinding::Frozen(layer) => layer.len(),
            })
            .sum()
    }
}

fn validate_layers(layers: &[ParameterLayer]) -> EngineResult<()> {
    for (index, layer) in layers.iter().enumerate() {
        if layer.name.trim().is_empty() {
            return Err(EngineError::configuration(format!(
                "policy layer {index} has an empty name"
            )));
        }
        if layers[..index].iter().any(|other| other.name == layer.name) {
            return Err(EngineError::configuration(format!(
                "policy layer name '{}' is not unique",
                layer.name
            )));
        }
        if layer.values.iter().any(|value| !value.is_finite()) {
            return Err(EngineError::configuration(format!(
                "policy layer '{}' contains non-finite values",
                layer.name
            )));
        }
    }
    Ok(())
}
