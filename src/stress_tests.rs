//! Stress tests designed to break the ratchet runtime.
//!
//! These tests exercise end-to-end scenarios, race conditions, and
//! potential failure modes across machines, mailboxes, and timers.

#[cfg(test)]
mod stress_tests {
    use crate::testing::{TraceRecord, TraceRecorder};
    use crate::{
        Chart, ChartBuilder, EventId, FaultKind, FaultRouter, Machine, RatchetError, TimerService,
    };
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..600 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 3s");
    }

    // ==========================================================================
    // Command Processor (retry with timeout, then error/reset recovery)
    // ==========================================================================

    const MAX_RETRIES: u32 = 1;
    const RESPONSE_TIMEOUT: Duration = Duration::from_millis(50);

    struct CommandCtx {
        attempts: u32,
    }

    struct CommandEvents {
        command: EventId,
        response: EventId,
        timeout: EventId,
    }

    fn command_processor() -> (Chart<CommandCtx>, CommandEvents) {
        let mut b = ChartBuilder::<CommandCtx>::new("command_processor");
        let command = b.event("Command");
        let response = b.event("Response");
        let timeout = b.event("ResponseTimeout");

        let wait_cmd = b.state("WaitForCommand");
        let wait_resp = b.state("WaitForResponse");
        let error = b.state("Error");
        let reset = b.state("Reset");
        b.initial(wait_cmd);

        b.on_entry(wait_resp, move |_, ctx| {
            ctx.schedule(timeout, RESPONSE_TIMEOUT)?;
            Ok(())
        });
        b.on_exit(wait_resp, move |_, ctx| {
            ctx.cancel(timeout)?;
            Ok(())
        });

        b.external().from(wait_cmd).to(wait_resp).on(command).done();
        b.external()
            .from(wait_resp)
            .to(wait_cmd)
            .on(response)
            .run(|c, _| {
                c.attempts = 0;
                Ok(())
            })
            .done();
        // First timeout: retry in place, nothing exits.
        b.internal()
            .within(wait_resp)
            .on(timeout)
            .when(|c, _| c.attempts < MAX_RETRIES)
            .run(move |c, ctx| {
                c.attempts += 1;
                ctx.schedule(timeout, RESPONSE_TIMEOUT)?;
                Ok(())
            })
            .done();
        // Retries exhausted: give up and recover through Error/Reset.
        b.external()
            .from(wait_resp)
            .to(error)
            .on(timeout)
            .when(|c, _| c.attempts >= MAX_RETRIES)
            .done();
        b.external().from(error).to(reset).done();
        b.external()
            .from(reset)
            .to(wait_cmd)
            .run(|c, _| {
                c.attempts = 0;
                Ok(())
            })
            .done();

        let events = CommandEvents {
            command,
            response,
            timeout,
        };
        (b.build().unwrap(), events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_processor_retries_once_then_recovers_through_reset() {
        let timer = TimerService::new();
        let recorder = TraceRecorder::new();
        let (chart, ev) = command_processor();
        let machine = recorder
            .attach(Machine::builder(chart, CommandCtx { attempts: 0 }).with_timer(&timer))
            .build();

        machine.start();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WaitForCommand")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        recorder.clear();

        // Two clean cycles: Response lands inside the timeout window.
        for _ in 0..2 {
            machine.post(ev.command).unwrap();
            recorder
                .wait_until(
                    |r| r.contains(&TraceRecord::entered("WaitForResponse")),
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            machine.post(ev.response).unwrap();
            recorder
                .wait_until(
                    |r| r.contains(&TraceRecord::entered("WaitForCommand")),
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert!(!recorder.entered().contains(&"Error".to_string()));
            recorder.clear();
        }

        // Third cycle: no response. One retry in place, then Error, then
        // the automatic completion chain back to WaitForCommand.
        machine.post(ev.command).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WaitForResponse")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        recorder.clear();

        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WaitForCommand")),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(recorder.entered(), ["Error", "Reset", "WaitForCommand"]);
        let retries = recorder
            .names()
            .iter()
            .filter(|n| *n == "fire:WaitForResponse->WaitForResponse@ResponseTimeout")
            .count();
        assert_eq!(retries, 1);

        // The reset took: the next cycle runs clean again.
        recorder.clear();
        machine.post(ev.command).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WaitForResponse")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        machine.post(ev.response).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WaitForCommand")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(!recorder.entered().contains(&"Error".to_string()));

        machine.stop().await;
        timer.shutdown().await;
    }

    // ==========================================================================
    // Break Time (deep history across a composite exit/re-entry)
    // ==========================================================================

    struct BreakEvents {
        milestone: EventId,
        take_break: EventId,
        break_over: EventId,
        back_to_work: EventId,
    }

    fn break_time() -> (Chart<()>, BreakEvents) {
        let mut b = ChartBuilder::<()>::new("break_time");
        let milestone = b.event("MilestoneMet");
        let take_break = b.event("Break");
        let break_over = b.event("BreakOver");
        let back_to_work = b.event("BackToWork");

        let take = b.state("TakeABreak");
        let over = b.state("BreakOver");
        let work = b.child(over, "WorkHard");
        let play = b.child(over, "PlayHard");
        b.initial(over);
        b.initial(work);
        let history = b.deep_history(over);

        b.external().from(work).to(play).on(milestone).done();
        b.external().from(over).to(take).on(take_break).done();
        b.external().from(take).to(history).on(break_over).done();
        b.external().from(play).to(work).on(back_to_work).done();

        let events = BreakEvents {
            milestone,
            take_break,
            break_over,
            back_to_work,
        };
        (b.build().unwrap(), events)
    }

    #[tokio::test]
    async fn test_break_resumes_play_via_deep_history_not_the_default() {
        let recorder = TraceRecorder::new();
        let (chart, ev) = break_time();
        let machine = recorder.attach(Machine::builder(chart, ())).build();

        machine.start();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WorkHard")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        machine.post(ev.milestone).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("PlayHard")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        machine.post(ev.take_break).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("TakeABreak")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        recorder.clear();

        machine.post(ev.break_over).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("PlayHard")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        // History resumed PlayHard directly; WorkHard never reappeared.
        assert_eq!(recorder.entered(), ["BreakOver", "PlayHard"]);
        assert!(machine.is_in_state_named("BreakOver"));
        assert!(machine.is_in_state_named("PlayHard"));

        machine.post(ev.back_to_work).unwrap();
        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("WorkHard")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        machine.stop().await;
    }

    // ==========================================================================
    // Initial chain vs. early events (boot settles first)
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_chain_settles_before_external_events() {
        let mut b = ChartBuilder::<()>::new("slow_boot");
        let poke = b.event("Poke");
        let outer = b.state("Outer");
        let mid = b.child(outer, "Mid");
        let leaf = b.child(mid, "Leaf");
        let parked = b.state("Parked");
        b.initial(outer);
        b.initial(mid);
        b.initial(leaf);
        // Slow entries widen the window in which an early event could cut
        // the boot chain short, if it were ever allowed to.
        for state in [outer, mid, leaf] {
            b.on_entry(state, |_, _| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(())
            });
        }
        b.external().from(leaf).to(parked).on(poke).done();

        let recorder = TraceRecorder::new();
        let machine = recorder.attach(Machine::builder(b.build().unwrap(), ())).build();

        machine.start();
        // Accepted immediately: the lifecycle is Running from start(),
        // even while the worker is still booting.
        machine.post(poke).unwrap();

        recorder
            .wait_until(
                |r| r.contains(&TraceRecord::entered("Parked")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        machine.stop().await;

        let names = recorder.names();
        let boot_done = names.iter().position(|n| n == "enter:Leaf").unwrap();
        let first_fire = names.iter().position(|n| n.starts_with("fire:")).unwrap();
        assert!(
            boot_done < first_fire,
            "initial chain must settle before the first event fires: {names:?}"
        );
    }

    // ==========================================================================
    // Multi-producer posting (exactly once, per-producer order, no
    // observable step interleaving)
    // ==========================================================================

    struct CollectCtx {
        seen: Arc<Mutex<Vec<(usize, u64)>>>,
        in_step: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_producers_deliver_exactly_once_in_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: u64 = 100;

        let mut b = ChartBuilder::<CollectCtx>::new("collector");
        let record = b.event("Record");
        let collect = b.state("Collect");
        b.initial(collect);
        b.internal()
            .within(collect)
            .on(record)
            .run(|c, ctx| {
                if c.in_step.swap(true, Ordering::SeqCst) {
                    c.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(&tagged) = ctx.trigger().payload::<(usize, u64)>() {
                    c.seen.lock().unwrap().push(tagged);
                }
                c.in_step.store(false, Ordering::SeqCst);
                Ok(())
            })
            .done();

        let seen: Arc<Mutex<Vec<(usize, u64)>>> = Arc::default();
        let overlaps: Arc<AtomicUsize> = Arc::default();
        let context = CollectCtx {
            seen: seen.clone(),
            in_step: Arc::default(),
            overlaps: overlaps.clone(),
        };
        let machine = Machine::builder(b.build().unwrap(), context).build();
        machine.start();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let mailbox = machine.mailbox();
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        mailbox
                            .post_with(record, Arc::new((producer, seq)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        eventually(|| seen.lock().unwrap().len() == PRODUCERS * PER_PRODUCER as usize).await;
        machine.stop().await;

        let seen = seen.lock().unwrap();
        // Exactly once: no duplicates across the whole run.
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER as usize);
        // Per-producer FIFO: each producer's sequence arrives ascending.
        for producer in 0..PRODUCERS {
            let sequence: Vec<u64> = seen
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            let expected: Vec<u64> = (0..PER_PRODUCER).collect();
            assert_eq!(sequence, expected, "producer {producer} posts reordered");
        }
        // Steps never interleaved as far as callbacks could observe.
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    // ==========================================================================
    // Many machines on one chart (isolation under load)
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_machines_share_a_chart_without_crosstalk() {
        const MACHINES: usize = 8;
        const FLIPS: usize = 200;

        let mut b = ChartBuilder::<Arc<AtomicUsize>>::new("ping_pong");
        let flip = b.event("Flip");
        let ping = b.state("Ping");
        let pong = b.state("Pong");
        b.initial(ping);
        b.external()
            .from(ping)
            .to(pong)
            .on(flip)
            .run(|hits, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .done();
        b.external()
            .from(pong)
            .to(ping)
            .on(flip)
            .run(|hits, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .done();
        let chart = Arc::new(b.build().unwrap());

        let fleet: Vec<(Machine<Arc<AtomicUsize>>, Arc<AtomicUsize>)> = (0..MACHINES)
            .map(|idx| {
                let hits: Arc<AtomicUsize> = Arc::default();
                let machine = Machine::builder(chart.clone(), hits.clone())
                    .with_name(&format!("ping_pong-{idx}"))
                    .build();
                machine.start();
                (machine, hits)
            })
            .collect();

        for (machine, _) in &fleet {
            for _ in 0..FLIPS {
                machine.post(flip).unwrap();
            }
        }

        for (machine, hits) in &fleet {
            eventually(|| hits.load(Ordering::SeqCst) == FLIPS).await;
            // An even number of flips lands back where it started.
            eventually(|| machine.is_in_state_named("Ping")).await;
        }
        for (machine, _) in &fleet {
            machine.stop().await;
        }
    }

    // ==========================================================================
    // Random event storm (configuration stays a root-to-leaf path)
    // ==========================================================================

    struct StormCtx {
        syncs: Arc<AtomicUsize>,
    }

    #[tokio::test]
    async fn test_random_event_storm_keeps_the_configuration_coherent() {
        fastrand::seed(0x5eed);

        let mut b = ChartBuilder::<StormCtx>::new("storm");
        let toggle = b.event("Toggle");
        let hop = b.event("Hop");
        let jiggle = b.event("Jiggle");
        let sync = b.event("Sync");

        let world = b.state("World");
        let p = b.child(world, "P");
        let pa = b.child(p, "Pa");
        let pb = b.child(p, "Pb");
        let q = b.child(world, "Q");
        let qa = b.child(q, "Qa");
        let qb = b.child(q, "Qb");
        b.initial(world);
        b.initial(p);
        b.initial(pa);
        b.initial(qa);

        b.external().from(pa).to(pb).on(toggle).done();
        b.external().from(pb).to(pa).on(toggle).done();
        b.external().from(qa).to(qb).on(toggle).done();
        b.external().from(qb).to(qa).on(toggle).done();
        b.external().from(p).to(q).on(hop).done();
        b.external().from(q).to(p).on(hop).done();
        // Jiggle is deliberately left unhandled so the storm also covers
        // the discard path.
        b.internal()
            .within(world)
            .on(sync)
            .run(|c, _| {
                c.syncs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .done();

        let syncs: Arc<AtomicUsize> = Arc::default();
        let machine = Machine::builder(
            b.build().unwrap(),
            StormCtx {
                syncs: syncs.clone(),
            },
        )
        .build();
        machine.start();

        let storm = [toggle, hop, jiggle];
        for round in 1..=3 {
            for _ in 0..500 {
                machine.post(storm[fastrand::usize(..storm.len())]).unwrap();
            }
            machine.post(sync).unwrap();
            eventually(|| syncs.load(Ordering::SeqCst) == round).await;

            let states = machine.active_states();
            assert!(!states.is_empty());
            assert_eq!(machine.chart().parent(states[0]), None);
            for pair in states.windows(2) {
                assert_eq!(
                    machine.chart().parent(pair[1]),
                    Some(pair[0]),
                    "active configuration is not a parent-child chain: {states:?}"
                );
            }
        }

        machine.stop().await;
    }

    // ==========================================================================
    // Bounded mailbox (overflow rejected, queued events survive)
    // ==========================================================================

    struct GateCtx {
        entered: Arc<AtomicBool>,
        gate: std::sync::mpsc::Receiver<()>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_mailbox_rejects_overflow_without_losing_queued_events() {
        let mut b = ChartBuilder::<GateCtx>::new("backpressure");
        let cycle = b.event("Cycle");
        let open = b.state("Open");
        let busy = b.state("Busy");
        b.initial(open);
        b.on_entry(busy, |c, _| {
            c.entered.store(true, Ordering::SeqCst);
            // Hold the worker here so the mailbox can fill behind it.
            let _ = c.gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        });
        b.external().from(open).to(busy).on(cycle).done();
        b.external().from(busy).to(open).on(cycle).done();

        let (release, gate) = std::sync::mpsc::channel();
        let entered: Arc<AtomicBool> = Arc::default();
        let machine = Machine::builder(
            b.build().unwrap(),
            GateCtx {
                entered: entered.clone(),
                gate,
            },
        )
        .with_capacity(1)
        .build();
        machine.start();

        machine.post(cycle).unwrap();
        eventually(|| entered.load(Ordering::SeqCst)).await;

        // Worker is wedged in Busy's entry; one slot is free again.
        machine.post(cycle).unwrap();
        let err = machine.post(cycle).unwrap_err();
        assert!(matches!(
            err,
            RatchetError::MailboxFull { capacity: 1, .. }
        ));

        release.send(()).unwrap();
        // The queued envelope was not lost: it carries the machine back.
        eventually(|| machine.is_in_state_named("Open")).await;
        machine.stop().await;
    }

    // ==========================================================================
    // Fault storm (broken callbacks everywhere, worker keeps going)
    // ==========================================================================

    struct ProbeCtx {
        probes: Arc<AtomicUsize>,
    }

    #[tokio::test]
    async fn test_fault_storm_leaves_the_worker_standing() {
        const CYCLES: usize = 50;

        let mut b = ChartBuilder::<ProbeCtx>::new("grinder");
        let swing = b.event("Swing");
        let probe = b.event("Probe");
        let steady = b.state("Steady");
        let flaky = b.state("Flaky");
        b.initial(steady);
        b.on_entry(flaky, |_, _| panic!("entry blew up"));
        b.on_exit(flaky, |_, _| anyhow::bail!("exit failed"));
        b.external().from(steady).to(flaky).on(swing).done();
        b.external().from(flaky).to(steady).on(swing).done();
        b.internal()
            .within(steady)
            .on(probe)
            .run(|c, _| {
                c.probes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .done();

        let kinds: Arc<Mutex<Vec<FaultKind>>> = Arc::default();
        let sink = kinds.clone();
        let router = FaultRouter::new();
        router.on_fault(move |fault| {
            sink.lock().unwrap().push(fault.kind);
        });

        let probes: Arc<AtomicUsize> = Arc::default();
        let machine = Machine::builder(
            b.build().unwrap(),
            ProbeCtx {
                probes: probes.clone(),
            },
        )
        .with_fault_router(&router)
        .build();
        machine.start();

        for _ in 0..CYCLES {
            machine.post(swing).unwrap();
            machine.post(swing).unwrap();
        }

        eventually(|| kinds.lock().unwrap().len() == CYCLES * 2).await;

        // Every cycle produced one entry fault and one exit fault, and
        // the machine is still on its feet, answering events.
        {
            let kinds = kinds.lock().unwrap();
            let entries = kinds.iter().filter(|k| **k == FaultKind::Entry).count();
            let exits = kinds.iter().filter(|k| **k == FaultKind::Exit).count();
            assert_eq!(entries, CYCLES);
            assert_eq!(exits, CYCLES);
        }
        assert!(machine.is_in_state_named("Steady"));

        machine.post(probe).unwrap();
        eventually(|| probes.load(Ordering::SeqCst) == 1).await;
        machine.stop().await;
    }
}
