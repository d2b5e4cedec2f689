//! How a training session synchronizes it's parameters through a `KVStore`.

use std::collections::HashMap;

use comms::{Key, specs::StoreKind};
use engine::Tensor;
use kvstore::{KVStore, optimization::Updater};
use log::debug;

use crate::{Result, TrainErr};

/// Parameters above this amount of elements are updated on the devices with a local store.
const MAX_LOCAL_UPDATE_SIZE: usize = 1024 * 1024 * 16;

/// The store a training session asked for.
pub enum StoreChoice {
    /// Every device updates it's own copy of the parameters.
    None,
    /// A store of this kind is created when it's worth it.
    Kind(StoreKind),
    /// An already connected store, distributed stores are given this way.
    Store(KVStore),
}

impl From<Option<StoreKind>> for StoreChoice {
    fn from(value: Option<StoreKind>) -> Self {
        match value {
            Some(kind) => Self::Kind(kind),
            None => Self::None,
        }
    }
}

fn priority(index: usize) -> i32 {
    -(index as i32)
}

fn key(index: usize) -> Key {
    index as Key
}

/// Picks the store for a session.
///
/// # Arguments
/// * `choice` - The store asked for.
/// * `num_device` - The amount of local devices.
/// * `arg_params` - The model's parameters.
///
/// # Returns
/// The store, if any, and whether the parameters are updated by it.
pub fn create_kvstore(
    choice: StoreChoice,
    num_device: usize,
    arg_params: &HashMap<String, Tensor>,
) -> Result<(Option<KVStore>, bool)> {
    let mut update_on_kvstore = true;

    let kv = match choice {
        StoreChoice::None => None,
        StoreChoice::Store(kv) => Some(kv),
        // A single device on a single machine has nothing to synchronize.
        StoreChoice::Kind(kind) if num_device == 1 && !kind.is_dist() => None,
        StoreChoice::Kind(kind) => {
            let kv = KVStore::create(kind)?;

            if kind == StoreKind::Local {
                let max_size = arg_params.values().map(Tensor::size).max().unwrap_or(0);

                if max_size > MAX_LOCAL_UPDATE_SIZE {
                    debug!(max_size = max_size; "parameters too large to update on the store");
                    update_on_kvstore = false;
                }
            }

            Some(kv)
        }
    };

    let update_on_kvstore = update_on_kvstore && kv.is_some();
    Ok((kv, update_on_kvstore))
}

/// Initializes every parameter on the store, pulling it back to the devices when the
/// store updates them.
///
/// # Arguments
/// * `kv` - The store.
/// * `param_arrays` - The parameters of every device, by index.
/// * `arg_params` - The initial values by name.
/// * `param_names` - The name of every index.
/// * `update_on_kvstore` - Whether the store updates the parameters.
pub fn initialize_kvstore(
    kv: &KVStore,
    param_arrays: &[Vec<Tensor>],
    arg_params: &HashMap<String, Tensor>,
    param_names: &[String],
    update_on_kvstore: bool,
) -> Result<()> {
    for (index, (devices, name)) in param_arrays.iter().zip(param_names).enumerate() {
        let value = arg_params.get(name).ok_or_else(|| {
            TrainErr::InvalidConfiguration(format!("parameter {name} has no initial value"))
        })?;

        kv.init(&[key(index)], std::slice::from_ref(value))?;

        if update_on_kvstore {
            kv.pull(key(index), devices, priority(index))?;
        }
    }

    Ok(())
}

/// Pushes every gradient to the store and pulls back the updated parameters.
pub fn update_params_on_kvstore(
    param_arrays: &[Vec<Tensor>],
    grad_arrays: &[Vec<Tensor>],
    kv: &KVStore,
) -> Result<()> {
    for (index, (params, grads)) in param_arrays.iter().zip(grad_arrays).enumerate() {
        if grads.is_empty() {
            continue;
        }

        kv.push(key(index), grads, priority(index))?;
        kv.pull(key(index), params, priority(index))?;
    }

    Ok(())
}

/// Updates the parameters of every device with `updater`.
///
/// With a store the gradients are first summed across devices and workers through it.
/// The update index of device `k`'s copy of parameter `i` is `i * num_device + k`.
pub fn update_params(
    param_arrays: &[Vec<Tensor>],
    grad_arrays: &[Vec<Tensor>],
    updater: &mut Updater,
    num_device: usize,
    kv: Option<&KVStore>,
) -> Result<()> {
    for (index, (params, grads)) in param_arrays.iter().zip(grad_arrays).enumerate() {
        if grads.is_empty() {
            continue;
        }

        if let Some(kv) = kv {
            kv.push(key(index), grads, priority(index))?;
            kv.pull(key(index), grads, priority(index))?;
        }

        for (k, (weight, grad)) in params.iter().zip(grads).enumerate() {
            let grad = grad.to_vec()?;
            weight.with_data_mut(|w| updater.update(index * num_device + k, &grad, w))?;
        }
    }

    Ok(())
}
