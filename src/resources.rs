//! Hardware resources available to a run.
//!
//! [`Resources`] is what tasks receive in `setup`: the device context plus
//! the processing resources that graph mapping assigns to device tasks.
//! A remote worker is just another [`ProcessingResource`]; the core never
//! looks past its command queue.

use crate::device::{CommandQueue, Context};
use crate::error::Result;

/// Kind of a processing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// A local device of the context's backend.
    Device(usize),
    /// A remote worker reachable at the given address.
    Remote(String),
}

/// A processing resource device tasks can be mapped onto.
#[derive(Clone)]
pub struct ProcessingResource {
    kind: ResourceKind,
    queue: CommandQueue,
}

impl ProcessingResource {
    /// What this resource is.
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Command queue used by nodes mapped to this resource.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

impl std::fmt::Display for ProcessingResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ResourceKind::Device(index) => write!(f, "device:{}", index),
            ResourceKind::Remote(address) => write!(f, "remote:{}", address),
        }
    }
}

impl std::fmt::Debug for ProcessingResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProcessingResource({})", self)
    }
}

/// Context, default queue and processing resources of a run.
#[derive(Clone)]
pub struct Resources {
    context: Context,
    default_queue: CommandQueue,
    processing: Vec<ProcessingResource>,
}

impl Resources {
    /// One processing resource per device of `context`.
    pub fn new(context: Context) -> Result<Self> {
        let default_queue = context.queue(0)?;
        let processing = (0..context.num_devices())
            .map(|index| {
                Ok(ProcessingResource {
                    kind: ResourceKind::Device(index),
                    queue: context.queue(index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            context,
            default_queue,
            processing,
        })
    }

    /// Add a remote worker as an additional processing resource.
    pub fn with_remote(mut self, address: impl Into<String>, queue: CommandQueue) -> Self {
        self.processing.push(ProcessingResource {
            kind: ResourceKind::Remote(address.into()),
            queue,
        });
        self
    }

    /// Device context buffers are allocated from.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Queue used by nodes that are not mapped to a processing resource.
    pub fn default_queue(&self) -> &CommandQueue {
        &self.default_queue
    }

    /// All processing resources, local devices first.
    pub fn processing_resources(&self) -> &[ProcessingResource] {
        &self.processing
    }

    /// Processing resource by index.
    pub fn processing_resource(&self, index: usize) -> Option<&ProcessingResource> {
        self.processing.get(index)
    }

    /// Number of local devices.
    pub fn num_devices(&self) -> usize {
        self.processing
            .iter()
            .filter(|r| matches!(r.kind, ResourceKind::Device(_)))
            .count()
    }

    /// Number of remote workers.
    pub fn num_remotes(&self) -> usize {
        self.processing.len() - self.num_devices()
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("context", &self.context)
            .field("processing", &self.processing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_resource_per_device() {
        let resources = Resources::new(Context::sim(3)).unwrap();
        assert_eq!(resources.num_devices(), 3);
        assert_eq!(resources.num_remotes(), 0);
        let kinds: Vec<_> = resources
            .processing_resources()
            .iter()
            .map(|r| r.kind().clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Device(0),
                ResourceKind::Device(1),
                ResourceKind::Device(2)
            ]
        );
        assert_eq!(resources.processing_resource(2).unwrap().queue().device(), 2);
    }

    #[test]
    fn test_remote_resource() {
        let ctx = Context::sim(1);
        let remote_queue = ctx.queue(0).unwrap();
        let resources = Resources::new(ctx)
            .unwrap()
            .with_remote("tcp://10.0.0.2:5555", remote_queue);

        assert_eq!(resources.num_devices(), 1);
        assert_eq!(resources.num_remotes(), 1);
        assert_eq!(
            resources.processing_resource(1).unwrap().to_string(),
            "remote:tcp://10.0.0.2:5555"
        );
    }

    #[test]
    fn test_host_only() {
        let resources = Resources::new(Context::sim(0)).unwrap();
        assert!(resources.processing_resources().is_empty());
        assert_eq!(resources.default_queue().device(), 0);
    }
}
