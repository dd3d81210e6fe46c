use crate::error::{Error, Result};
use tracing::info;

/// Name of the single axis every mesh in this crate is built with.
pub const MESH_AXIS: &str = "x";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Cpu,
}

/// One addressable compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub id: usize,
    pub platform: Platform,
}

/// Supplies the ordered list of devices a mesh is built from.
pub trait DeviceProvider {
    fn devices(&self) -> Vec<Device>;
}

/// `count` logical CPU devices in this process.
///
/// Every device's shards live in host memory and per-device work runs on the rayon pool, so a
/// multi-device mesh can be exercised on a single machine.
#[derive(Debug, Clone, Copy)]
pub struct HostDevices {
    count: usize,
}

impl HostDevices {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl DeviceProvider for HostDevices {
    fn devices(&self) -> Vec<Device> {
        (0..self.count)
            .map(|id| Device {
                id,
                platform: Platform::Cpu,
            })
            .collect()
    }
}

/// A one-dimensional grid of devices with a single named axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    devices: Vec<Device>,
    axis_name: String,
}

impl Mesh {
    /// Builds a mesh whose only axis spans `devices` in order.
    ///
    /// # Errors
    ///
    /// Fails if `devices` is empty or lists the same device twice.
    pub fn new(devices: Vec<Device>, axis_name: impl Into<String>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("a mesh needs at least one device".to_string()));
        }
        for (i, d) in devices.iter().enumerate() {
            if devices[..i].contains(d) {
                return Err(Error::Config(format!(
                    "device {} appears twice in the mesh",
                    d.id
                )));
            }
        }
        Ok(Self {
            devices,
            axis_name: axis_name.into(),
        })
    }

    /// A mesh over the single host device.
    pub fn single_host() -> Self {
        Self {
            devices: HostDevices::new(1).devices(),
            axis_name: MESH_AXIS.to_string(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of devices along the mesh axis.
    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn axis_name(&self) -> &str {
        &self.axis_name
    }

    /// Number of devices along `name`, or `None` if the mesh has no such axis.
    pub fn axis_size(&self, name: &str) -> Option<usize> {
        (name == self.axis_name).then_some(self.devices.len())
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::single_host()
    }
}

/// Startup routine: builds the mesh every sharding in the process is resolved against.
///
/// Call once, before initializing weights or caches. Nothing in this crate configures devices
/// implicitly.
pub fn create_mesh<P: DeviceProvider>(provider: &P) -> Result<Mesh> {
    let mesh = Mesh::new(provider.devices(), MESH_AXIS)?;
    info!(devices = mesh.size(), axis = MESH_AXIS, "created device mesh");
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mesh() {
        let mesh = create_mesh(&HostDevices::new(4)).unwrap();
        assert_eq!(mesh.size(), 4);
        assert_eq!(mesh.axis_name(), "x");
        assert_eq!(mesh.axis_size("x"), Some(4));
        assert_eq!(mesh.axis_size("y"), None);
        assert_eq!(mesh.devices()[3].id, 3);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        assert!(matches!(
            create_mesh(&HostDevices::new(0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let d = Device {
            id: 0,
            platform: Platform::Cpu,
        };
        assert!(Mesh::new(vec![d, d], "x").is_err());
    }
}
