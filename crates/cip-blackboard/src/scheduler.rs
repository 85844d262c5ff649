use cip_core::{ProbeBudget, Suspect};
use std::collections::VecDeque;
use std::time::Duration;

/// Probe control block: per-probe scheduler state for one suspect.
#[derive(Debug, Clone, PartialEq)]
pub struct Pcb {
    pub id: String,
    pub suspect_id: String,
    pub quantum_ops: u32,
    pub time_budget: Duration,
    pub priority: i32,
    pub observed_gain_sum: f64,
}

/// Round-robin ready queue over probe control blocks. Positive observed
/// gain boosts a PCB toward the head on re-entry; non-positive gain
/// demotes it to the tail and charges a fixed time-budget penalty.
/// Exhausted PCBs (no quanta or no budget left) retire at pop time.
#[derive(Debug)]
pub struct ProbeScheduler {
    ready: VecDeque<Pcb>,
    penalty: Duration,
}

impl ProbeScheduler {
    pub fn new(penalty: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            penalty,
        }
    }

    /// Seed one PCB per suspect in suspicion order, most suspicious first.
    pub fn seed(suspects: &[Suspect], budget: &ProbeBudget, penalty: Duration) -> Self {
        let mut scheduler = Self::new(penalty);
        let mut ranked: Vec<&Suspect> = suspects.iter().collect();
        ranked.sort_by(|a, b| {
            b.suspicion
                .partial_cmp(&a.suspicion)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        for (idx, suspect) in ranked.iter().enumerate() {
            scheduler.add_pcb(Pcb {
                id: format!("pcb-{}", idx + 1),
                suspect_id: suspect.id.clone(),
                quantum_ops: budget.quantum_ops,
                time_budget: Duration::from_secs(budget.time_budget_secs),
                priority: 0,
                observed_gain_sum: 0.0,
            });
        }
        scheduler
    }

    pub fn add_pcb(&mut self, pcb: Pcb) {
        self.ready.push_back(pcb);
    }

    /// Pop the head of the ready queue, discarding retired PCBs on the
    /// way. The caller owns the PCB while its probe runs and hands it
    /// back through [`record_gain`](Self::record_gain).
    pub fn next_pcb(&mut self) -> Option<Pcb> {
        while let Some(pcb) = self.ready.pop_front() {
            if pcb.quantum_ops == 0 || pcb.time_budget.is_zero() {
                continue;
            }
            return Some(pcb);
        }
        None
    }

    /// Fold a finished probe's gain into its PCB and re-enter it.
    pub fn record_gain(&mut self, mut pcb: Pcb, gain: f64) {
        pcb.observed_gain_sum += gain;
        pcb.quantum_ops = pcb.quantum_ops.saturating_sub(1);
        if gain > 0.0 {
            pcb.priority += 1;
            self.boost(pcb);
        } else {
            self.preempt(pcb);
        }
    }

    /// Re-enter a PCB at the head of the queue.
    pub fn boost(&mut self, pcb: Pcb) {
        self.ready.push_front(pcb);
    }

    /// Demote a PCB to the tail and charge the fixed time penalty.
    pub fn preempt(&mut self, mut pcb: Pcb) {
        pcb.time_budget = pcb.time_budget.saturating_sub(self.penalty);
        self.ready.push_back(pcb);
    }

    pub fn is_empty(&self) -> bool {
        self.ready
            .iter()
            .all(|pcb| pcb.quantum_ops == 0 || pcb.time_budget.is_zero())
    }

    /// PCBs currently eligible to run.
    pub fn ready_len(&self) -> usize {
        self.ready
            .iter()
            .filter(|pcb| pcb.quantum_ops > 0 && !pcb.time_budget.is_zero())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cip_core::AstSpan;
    use std::collections::HashMap;

    fn suspect(id: &str, suspicion: f64) -> Suspect {
        Suspect {
            id: id.to_string(),
            span: AstSpan::new("mod.py", 1, 2, "FunctionDef"),
            kind: "FunctionDef".to_string(),
            hop: 0,
            in_stack: false,
            suspicion,
        }
    }

    /// Drain one full pass over the ready queue, apply per-suspect gains,
    /// and return the dispatch order. Mirrors how the probe driver batches
    /// a round before feedback lands.
    fn run_round(scheduler: &mut ProbeScheduler, gains: &HashMap<&str, f64>, dispatched: &mut Vec<String>) {
        let mut batch = Vec::new();
        for _ in 0..scheduler.ready_len() {
            let Some(pcb) = scheduler.next_pcb() else { break };
            dispatched.push(pcb.suspect_id.clone());
            batch.push(pcb);
        }
        for pcb in batch {
            let gain = gains.get(pcb.suspect_id.as_str()).copied().unwrap_or(0.0);
            scheduler.record_gain(pcb, gain);
        }
    }

    #[test]
    fn seed_orders_by_suspicion() {
        let suspects = vec![suspect("low", 0.2), suspect("high", 0.9)];
        let mut scheduler = ProbeScheduler::seed(&suspects, &ProbeBudget::default(), Duration::from_secs(10));
        assert_eq!(scheduler.next_pcb().expect("head").suspect_id, "high");
    }

    #[test]
    fn positive_gain_is_scheduled_strictly_more_often() {
        let suspects = vec![suspect("a", 0.5), suspect("b", 0.5)];
        let budget = ProbeBudget {
            quantum_ops: 4,
            time_budget_secs: 10,
            ..ProbeBudget::default()
        };
        let mut scheduler = ProbeScheduler::seed(&suspects, &budget, Duration::from_secs(10));
        let gains = HashMap::from([("a", 1.0), ("b", 0.0)]);

        let mut dispatched = Vec::new();
        run_round(&mut scheduler, &gains, &mut dispatched);
        run_round(&mut scheduler, &gains, &mut dispatched);

        let a_runs = dispatched.iter().filter(|s| *s == "a").count();
        let b_runs = dispatched.iter().filter(|s| *s == "b").count();
        assert!(b_runs >= 1, "b must get its first quantum");
        assert!(a_runs > b_runs, "gainful suspect must dominate: a={a_runs} b={b_runs}");
    }

    #[test]
    fn round_robin_is_fair_under_equal_gain() {
        let suspects = vec![suspect("a", 0.5), suspect("b", 0.5), suspect("c", 0.5)];
        let budget = ProbeBudget {
            quantum_ops: 5,
            time_budget_secs: 1000,
            ..ProbeBudget::default()
        };
        let mut scheduler = ProbeScheduler::seed(&suspects, &budget, Duration::from_secs(1));
        let gains = HashMap::from([("a", 0.5), ("b", 0.5), ("c", 0.5)]);

        let mut dispatched = Vec::new();
        for _ in 0..4 {
            run_round(&mut scheduler, &gains, &mut dispatched);
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for suspect_id in &dispatched {
            *counts.entry(suspect_id.as_str()).or_default() += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        let min = counts.values().copied().min().unwrap_or(0);
        assert!(max - min <= 1, "unfair schedule: {counts:?}");
    }

    #[test]
    fn pcbs_retire_when_quanta_run_out() {
        let mut scheduler = ProbeScheduler::new(Duration::from_secs(1));
        scheduler.add_pcb(Pcb {
            id: "pcb-1".into(),
            suspect_id: "a".into(),
            quantum_ops: 1,
            time_budget: Duration::from_secs(100),
            priority: 0,
            observed_gain_sum: 0.0,
        });
        let pcb = scheduler.next_pcb().expect("first run");
        scheduler.record_gain(pcb, 1.0);
        assert!(scheduler.next_pcb().is_none(), "quantum exhausted");
    }

    #[test]
    fn preemption_charges_the_time_penalty_until_retirement() {
        let mut scheduler = ProbeScheduler::new(Duration::from_secs(10));
        scheduler.add_pcb(Pcb {
            id: "pcb-1".into(),
            suspect_id: "a".into(),
            quantum_ops: 10,
            time_budget: Duration::from_secs(20),
            priority: 0,
            observed_gain_sum: 0.0,
        });
        let pcb = scheduler.next_pcb().expect("run 1");
        scheduler.record_gain(pcb, 0.0);
        let pcb = scheduler.next_pcb().expect("run 2");
        scheduler.record_gain(pcb, -0.5);
        assert!(scheduler.next_pcb().is_none(), "two penalties drain a 20s budget");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn gain_sum_accumulates_on_the_pcb() {
        let mut scheduler = ProbeScheduler::new(Duration::from_secs(1));
        scheduler.add_pcb(Pcb {
            id: "pcb-1".into(),
            suspect_id: "a".into(),
            quantum_ops: 5,
            time_budget: Duration::from_secs(100),
            priority: 0,
            observed_gain_sum: 0.0,
        });
        let pcb = scheduler.next_pcb().expect("run 1");
        scheduler.record_gain(pcb, 1.0);
        let pcb = scheduler.next_pcb().expect("run 2");
        assert_eq!(pcb.observed_gain_sum, 1.0);
        assert_eq!(pcb.priority, 1);
        scheduler.record_gain(pcb, 0.5);
        let pcb = scheduler.next_pcb().expect("run 3");
        assert_eq!(pcb.observed_gain_sum, 1.5);
    }
}
