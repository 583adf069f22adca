// pass.rs — Pass descriptors, dependency resolution and artifact IDs
//
// Declares the compiler's seven passes (parsing happens before the runner),
// their dependency edges and the artifacts they produce. The pipeline runs
// the minimal prefix needed for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (parse excluded; handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    BuildIr,
    Tune,
    Validate,
    PlaceShared,
    Liveness,
    Allocate,
    Select,
}

/// Machine-readable artifact identifiers, one per field of the
/// compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Module,     // ir::Module
    Tuner,      // tune::Tuner
    Violations, // Vec<Diagnostic> (W0201)
    Copies,     // shared::SharedCopies
    Intervals,  // liveness::Liveness
    Offsets,    // allocation::Allocation
    Lir,        // lir::LirModule
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Name used in log output.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postcondition, documentation only.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::BuildIr => PassDescriptor {
            name: "build_ir",
            inputs: &[],
            outputs: &[ArtifactId::Module],
            invalidation_key: "source",
            invariants: "every value has a type, every block one terminator",
        },
        PassId::Tune => PassDescriptor {
            name: "tune",
            inputs: &[PassId::BuildIr],
            outputs: &[ArtifactId::Tuner],
            invalidation_key: "module + target + overrides",
            invariants: "parameters enumerated in definition order, overrides applied",
        },
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[PassId::Tune],
            outputs: &[ArtifactId::Violations],
            invalidation_key: "tuner",
            invariants: "violations reported, tuner unchanged",
        },
        PassId::PlaceShared => PassDescriptor {
            name: "place_shared",
            inputs: &[PassId::Tune],
            outputs: &[ArtifactId::Copies],
            invalidation_key: "module",
            invariants: "every reduction operand is a shared-memory copy",
        },
        PassId::Liveness => PassDescriptor {
            name: "liveness",
            inputs: &[PassId::PlaceShared],
            outputs: &[ArtifactId::Intervals],
            invalidation_key: "module + copies",
            invariants: "one interval per staged value, sorted by start",
        },
        PassId::Allocate => PassDescriptor {
            name: "allocate",
            inputs: &[PassId::Validate, PassId::Liveness],
            outputs: &[ArtifactId::Offsets],
            invalidation_key: "intervals + tuner + shared memory budget",
            invariants: "no two live values share bytes, peak within budget",
        },
        PassId::Select => PassDescriptor {
            name: "select",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::Lir],
            invalidation_key: "module + tuner + copies + offsets",
            invariants: "one LIR function per kernel, all phis complete",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 7] = [
    PassId::BuildIr,
    PassId::Tune,
    PassId::Validate,
    PassId::PlaceShared,
    PassId::Liveness,
    PassId::Allocate,
    PassId::Select,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_for_params_skip_staging() {
        let passes = required_passes(PassId::Validate);
        assert_eq!(passes, vec![PassId::BuildIr, PassId::Tune, PassId::Validate]);
        assert!(!passes.contains(&PassId::PlaceShared));
    }

    #[test]
    fn required_passes_select_includes_all() {
        let passes = required_passes(PassId::Select);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn liveness_does_not_wait_for_validation() {
        let passes = required_passes(PassId::Liveness);
        assert_eq!(
            passes,
            vec![
                PassId::BuildIr,
                PassId::Tune,
                PassId::PlaceShared,
                PassId::Liveness
            ]
        );
    }

    #[test]
    fn build_ir_is_minimal() {
        assert_eq!(required_passes(PassId::BuildIr), vec![PassId::BuildIr]);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(!desc.outputs.is_empty(), "pass {:?} has no outputs declared", pass);
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let order = required_passes(*pass);
            let self_pos = order.iter().position(|p| p == pass).unwrap();
            for dep in descriptor(*pass).inputs {
                let dep_pos = order.iter().position(|p| p == dep).unwrap();
                assert!(
                    dep_pos < self_pos,
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
