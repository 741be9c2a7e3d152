//! Terminal target picker

use std::cmp::Ordering;
use std::io::Write;

use itarget_app::TargetPicker;
use itarget_core::prelude::*;
use itarget_core::{SimulatorState, Target};

/// Interactive picker printing a numbered menu on stderr and reading the
/// choice from stdin. An empty or invalid answer dismisses the pick.
pub struct TerminalPicker;

impl TargetPicker for TerminalPicker {
    async fn pick(&self, mut targets: Vec<Target>) -> Result<Option<Target>> {
        if targets.is_empty() {
            eprintln!("No targets found.");
            return Ok(None);
        }

        sort_for_display(&mut targets);

        eprintln!("Select iOS target:");
        for (index, target) in targets.iter().enumerate() {
            eprintln!(
                "  {:>2}) {:<28} {:<16} {} \u{2027} {}",
                index + 1,
                target.name(),
                describe(target),
                target.kind(),
                target.runtime(),
            );
        }
        eprint!("Target (1-{}): ", targets.len());
        let _ = std::io::stderr().flush();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| Error::spawn(format!("picker input task failed: {}", e)))??;

        let choice = line
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=targets.len()).contains(n));

        Ok(choice.map(|n| targets[n - 1].clone()))
    }
}

fn describe(target: &Target) -> &str {
    match target {
        Target::Simulator(simulator) => match simulator.state {
            SimulatorState::Booted => "Booted",
            SimulatorState::Shutdown => "",
        },
        Target::Device(device) => &device.model_name,
    }
}

/// Devices before simulators, booted simulators before shut-down ones,
/// listing order otherwise.
fn sort_for_display(targets: &mut [Target]) {
    targets.sort_by(|a, b| {
        a.kind().cmp(b.kind()).then_with(|| match (a, b) {
            (Target::Simulator(x), Target::Simulator(y)) => boot_rank(x.state).cmp(&boot_rank(y.state)),
            _ => Ordering::Equal,
        })
    });
}

fn boot_rank(state: SimulatorState) -> u8 {
    match state {
        SimulatorState::Booted => 0,
        SimulatorState::Shutdown => 1,
    }
}
