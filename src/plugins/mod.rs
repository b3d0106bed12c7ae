//! Extension analysers and their dispatch.
//!
//! Two analyser families: one working on a single conversation at a time,
//! one working on the whole conversation set. The pipeline isolates
//! failures so one misbehaving analyser never stops the run.
pub mod algorithms;
pub mod stepping_stone_clientside;
pub mod stepping_stone_onoff;
pub mod stepping_stone_serverside;
pub mod version_exchange;

use crate::analyser::containers::Connection;
use crate::analyser::error::AnalysisError;

/// An analyser invoked once per conversation.
///
/// `activate` and `deactivate` bracket every invocation, including failing
/// ones. `analyse` may write the conversation's result slots and keep
/// private state for `result_repr`.
pub trait SingleConnectionAnalyser {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// The report fields this analyser can produce. Probed once before the
    /// pipeline runs; failing the probe removes the analyser.
    fn result_fields(&self) -> Result<&'static [&'static str], AnalysisError>;
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn analyse(&mut self, connection: &mut Connection) -> Result<(), AnalysisError>;
    /// Field/value pairs for the last analysed conversation.
    fn result_repr(&self) -> Vec<(&'static str, String)>;
}

/// An analyser looking at links between conversations, invoked once with
/// the full set after the per-conversation analysers are done.
pub trait InterConnectionsAnalyser {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn analyse(&mut self, connections: &mut [Connection]) -> Result<(), AnalysisError>;
    fn result_repr(&self) -> String;
}

/// The fixed, ordered analyser pipeline.
pub struct AnalyserPipeline {
    single: Vec<Box<dyn SingleConnectionAnalyser>>,
    inter: Vec<Box<dyn InterConnectionsAnalyser>>,
}

impl AnalyserPipeline {
    /// Probes every single-connection analyser for its report fields and
    /// drops the ones whose probe fails.
    pub fn new(
        single: Vec<Box<dyn SingleConnectionAnalyser>>,
        inter: Vec<Box<dyn InterConnectionsAnalyser>>,
    ) -> Self {
        let single = single
            .into_iter()
            .filter(|analyser| match analyser.result_fields() {
                Ok(_) => true,
                Err(err) => {
                    log::error!(
                        "Analyser {} fatal error: {}, {err}",
                        analyser.name(),
                        err.kind()
                    );
                    false
                }
            })
            .collect();
        Self { single, inter }
    }

    /// The standard analyser set, in its fixed order.
    pub fn standard() -> Self {
        Self::new(
            vec![
                Box::new(version_exchange::ProtocolVersionExchange::default()),
                Box::new(algorithms::Algorithms::default()),
                Box::new(stepping_stone_serverside::ServerSideDetection::default()),
                Box::new(stepping_stone_clientside::ClientSideEstimation::default()),
            ],
            vec![Box::new(
                stepping_stone_onoff::OffCoincidenceDetection::default(),
            )],
        )
    }

    /// Name and description of every analyser, for `--list-plugins`.
    pub fn descriptions(&self) -> Vec<(&'static str, &'static str)> {
        let mut out: Vec<(&'static str, &'static str)> = self
            .single
            .iter()
            .map(|a| (a.name(), a.description()))
            .collect();
        out.extend(self.inter.iter().map(|a| (a.name(), a.description())));
        out
    }

    /// Runs every single-connection analyser over one conversation and
    /// collects the printable results.
    ///
    /// Soft failures are logged and skip the analyser for this conversation;
    /// anything else is logged as a crash. The pipeline continues either way.
    pub fn analyse_connection(
        &mut self,
        connection: &mut Connection,
    ) -> Vec<(&'static str, String)> {
        let mut results = Vec::new();
        for analyser in &mut self.single {
            log::info!(
                "Analyse connection {} with analyser {}",
                connection.nb,
                analyser.name()
            );
            analyser.activate();
            match analyser.analyse(connection) {
                Ok(()) => results.extend(analyser.result_repr()),
                Err(err) if err.is_soft() => {
                    log::warn!("Analyser {}: {err}", analyser.name());
                }
                Err(err) => {
                    log::error!("Analyser {} crash: {}, {err}", analyser.name(), err.kind());
                }
            }
            analyser.deactivate();
        }
        results
    }

    /// Runs the inter-connection analysers over the whole set and collects
    /// one printable block per analyser.
    pub fn analyse_set(&mut self, connections: &mut [Connection]) -> Vec<String> {
        let mut results = Vec::new();
        for analyser in &mut self.inter {
            log::info!("Using analyser {}", analyser.name());
            analyser.activate();
            match analyser.analyse(connections) {
                Ok(()) => results.push(analyser.result_repr()),
                Err(err) if err.is_soft() => {
                    log::warn!("Analyser {}: {err}", analyser.name());
                    results.push(analyser.result_repr());
                }
                Err(err) => {
                    log::error!("Analyser {} crash: {}, {err}", analyser.name(), err.kind());
                }
            }
            analyser.deactivate();
        }
        results
    }
}
