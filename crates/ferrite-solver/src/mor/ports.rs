//! Port mapping for model-order reduction.
//!
//! A port is a node driven by an independent voltage source. The source's
//! branch row in `G` becomes the port row of `B`.

use ferrite_core::{Communicator, DaeMatrix, Topology};
use ferrite_devices::VsourceRow;
use log::debug;

use crate::error::{Error, Result};

/// User port names and the matching voltage-source branch rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PortMap {
    names: Vec<String>,
    rows: Vec<usize>,
}

impl PortMap {
    /// Match each port node to the voltage source whose positive terminal it is.
    ///
    /// The number of voltage sources, summed over all partitions, must equal
    /// the number of ports.
    pub fn build(
        ports: &[String],
        sources: &[VsourceRow],
        topology: &Topology,
        comm: &dyn Communicator,
    ) -> Result<Self> {
        let local = sources.len() as f64;
        let total = comm.sum_all(&[local]).first().copied().unwrap_or(local) as usize;
        if total != ports.len() {
            return Err(Error::InvalidPortList(format!(
                "{} ports given but the circuit has {} voltage sources",
                ports.len(),
                total
            )));
        }

        let mut rows = Vec::with_capacity(ports.len());
        for port in ports {
            let node = topology.lookup(port).ok_or_else(|| {
                Error::InvalidPortList(format!("port node '{}' does not exist", port))
            })?;
            let source = sources
                .iter()
                .find(|s| topology.lookup(&s.pos_node) == Some(node))
                .ok_or_else(|| {
                    Error::InvalidPortList(format!("no voltage source drives port '{}'", port))
                })?;
            debug!(
                "port {} -> {} branch row {}",
                port,
                source.device,
                source.row.index()
            );
            rows.push(source.row.index());
        }
        Ok(Self {
            names: ports.to_vec(),
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Branch rows, one per port, in port order.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Make every port row of `g` carry a single non-positive coefficient.
    ///
    /// A port row with other than exactly one nonzero entry is rejected.
    pub fn normalize_rows(&self, g: &mut DaeMatrix) -> Result<()> {
        for (name, &row) in self.names.iter().zip(&self.rows) {
            let entries: Vec<(usize, f64)> = g.row(row).filter(|&(_, v)| v != 0.0).collect();
            let &[(col, value)] = entries.as_slice() else {
                return Err(Error::InvalidPortList(format!(
                    "voltage source row for port '{}' has {} entries, expected 1",
                    name,
                    entries.len()
                )));
            };
            if value > 0.0 {
                g.set(row, col, -value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Assembler, LoadParams};
    use ferrite_core::SerialComm;
    use ferrite_devices::{DeviceRegistry, DeviceSpec};

    fn assembler(specs: &[DeviceSpec]) -> Assembler {
        Assembler::from_specs(&DeviceRegistry::with_builtins(), specs).unwrap()
    }

    fn rl() -> Assembler {
        assembler(&[
            DeviceSpec::new("V1", &["in", "0"], Some(0.0)),
            DeviceSpec::new("R1", &["in", "mid"], Some(1.0)),
            DeviceSpec::new("L1", &["mid", "0"], Some(1e-3)),
        ])
    }

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn port_rows_become_non_positive() {
        let asm = rl();
        let map = PortMap::build(
            &ports(&["in"]),
            &asm.voltage_source_rows(),
            asm.topology(),
            &SerialComm,
        )
        .unwrap();
        assert_eq!(map.len(), 1);

        let mut asm = asm;
        let sol = asm.new_solution_set();
        assert!(asm.load_dae_matrices(&LoadParams::dc(0.0), &sol));
        let mut g = asm.df_dx().clone();

        let row = map.rows()[0];
        let before: Vec<f64> = g.row(row).map(|(_, v)| v).filter(|v| *v != 0.0).collect();
        assert_eq!(before, vec![1.0]);
        map.normalize_rows(&mut g).unwrap();
        let after: Vec<f64> = g.row(row).map(|(_, v)| v).filter(|v| *v != 0.0).collect();
        assert_eq!(after, vec![-1.0]);

        // already normalized rows are left alone
        map.normalize_rows(&mut g).unwrap();
        assert_eq!(g.nonzero_count(row), 1);
        assert!(g.row(row).all(|(_, v)| v <= 0.0));
    }

    #[test]
    fn port_count_must_match_sources() {
        let asm = rl();
        let err = PortMap::build(
            &ports(&["in", "mid"]),
            &asm.voltage_source_rows(),
            asm.topology(),
            &SerialComm,
        );
        assert!(matches!(err, Err(Error::InvalidPortList(_))));
    }

    #[test]
    fn port_must_be_driven_by_a_source() {
        let asm = rl();
        let err = PortMap::build(
            &ports(&["mid"]),
            &asm.voltage_source_rows(),
            asm.topology(),
            &SerialComm,
        );
        assert!(matches!(err, Err(Error::InvalidPortList(_))));
        let err = PortMap::build(
            &ports(&["nowhere"]),
            &asm.voltage_source_rows(),
            asm.topology(),
            &SerialComm,
        );
        assert!(matches!(err, Err(Error::InvalidPortList(_))));
    }

    #[test]
    fn floating_source_row_is_rejected() {
        let mut asm = assembler(&[
            DeviceSpec::new("V1", &["a", "b"], Some(1.0)),
            DeviceSpec::new("R1", &["a", "0"], Some(1.0)),
            DeviceSpec::new("R2", &["b", "0"], Some(1.0)),
        ]);
        let map = PortMap::build(
            &ports(&["a"]),
            &asm.voltage_source_rows(),
            asm.topology(),
            &SerialComm,
        )
        .unwrap();
        let sol = asm.new_solution_set();
        assert!(asm.load_dae_matrices(&LoadParams::dc(0.0), &sol));
        let mut g = asm.df_dx().clone();
        assert!(matches!(
            map.normalize_rows(&mut g),
            Err(Error::InvalidPortList(_))
        ));
    }
}
