//! Scenario scheduler behavior driven through the public API, plus one full
//! harness round trip: fake OBIS <-> dispatcher <-> bus channels <-> scenario.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use railbus::bench::TestBench;
use railbus::config::{BridgeConfig, BridgeSection, ChannelsConfig, TransportConfig};
use railbus::protocol::{Message, ProtocolFamily, Telegram, TelegramId};
use railbus::scheduler::ScenarioScheduler;
use railbus::{Dispatcher, SimulatorInterface};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn five_timed_steps_run_in_order() {
    let mut scheduler = ScenarioScheduler::new();
    let sequence: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    for (when, value) in [(0.1, 0), (0.2, 1), (0.21, 2), (0.3, 3), (0.4, 4)] {
        let sequence = Rc::clone(&sequence);
        scheduler
            .add_step(when, move |_: &mut ScenarioScheduler| {
                sequence.borrow_mut().push(value)
            })
            .unwrap();
    }
    scheduler.play().await;

    assert_eq!(*sequence.borrow(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn harness_scenario_answers_obis_over_the_bridge() {
    // Dispatcher process side.
    let config = BridgeConfig {
        bridge: BridgeSection {
            name: "piaes".into(),
            family: ProtocolFamily::Telegram,
            transport: TransportConfig::Tcp { bind: "127.0.0.1:0".parse().unwrap() },
            channels: ChannelsConfig {
                command: "127.0.0.1:0".parse().unwrap(),
                telemetry: "127.0.0.1:0".parse().unwrap(),
            },
        },
    };
    let mut dispatcher = Dispatcher::new(config);
    dispatcher.create_sessions().await.unwrap();
    let obis_addr = dispatcher.transport_addr().unwrap();
    let command_addr = dispatcher.command_addr().unwrap();
    let telemetry_addr = dispatcher.telemetry_addr().unwrap();
    let handle = dispatcher.handle();
    let bridge = tokio::spawn(async move { dispatcher.run().await });

    // Scenario process side: grant the voice channel whenever OBIS asks.
    let mut bench = TestBench::new("dva-grant");
    let piaes = bench
        .add_simulator_interface("piaes", command_addr, telemetry_addr)
        .await
        .unwrap();

    let granted = Rc::new(RefCell::new(0));
    let granted_cb = Rc::clone(&granted);
    let sender = Rc::clone(&piaes);
    piaes.borrow_mut().set_callback(TelegramId::RequestDva.tag(), move |message| {
        assert!(matches!(message, Message::Telegram(_)));
        *granted_cb.borrow_mut() += 1;
        sender
            .borrow()
            .send(Message::Telegram(Telegram::response_dva(true)))
            .unwrap();
    });

    // Keep the scenario alive long enough for the exchange, then end it.
    bench.add_step(1.0, |_: &mut ScenarioScheduler| {}).unwrap();

    // Fake OBIS: connect, ask for the DVA, expect the grant back.
    let exchange = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut obis = TcpStream::connect(obis_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        obis.write_all(&Telegram::request_dva().encode().unwrap()).await.unwrap();

        let expected = Telegram::response_dva(true).encode().unwrap();
        let mut wire = vec![0u8; expected.len()];
        timeout(Duration::from_secs(2), obis.read_exact(&mut wire))
            .await
            .expect("grant within deadline")
            .unwrap();
        assert_eq!(wire, expected);
    });

    bench.play().await;
    exchange.await.unwrap();
    assert_eq!(*granted.borrow(), 1);

    handle.stop();
    assert!(bridge.await.unwrap().is_ok());
}

#[tokio::test]
async fn telemetry_arrival_wakes_the_scenario_before_its_next_deadline() {
    let config = BridgeConfig {
        bridge: BridgeSection {
            name: "piaes".into(),
            family: ProtocolFamily::Telegram,
            transport: TransportConfig::Tcp { bind: "127.0.0.1:0".parse().unwrap() },
            channels: ChannelsConfig {
                command: "127.0.0.1:0".parse().unwrap(),
                telemetry: "127.0.0.1:0".parse().unwrap(),
            },
        },
    };
    let mut dispatcher = Dispatcher::new(config);
    dispatcher.create_sessions().await.unwrap();
    let obis_addr = dispatcher.transport_addr().unwrap();
    let command_addr = dispatcher.command_addr().unwrap();
    let telemetry_addr = dispatcher.telemetry_addr().unwrap();
    let handle = dispatcher.handle();
    let bridge = tokio::spawn(async move { dispatcher.run().await });

    let mut scheduler = ScenarioScheduler::new();
    let (interface, feed) =
        SimulatorInterface::connect("piaes", command_addr, telemetry_addr).await.unwrap();
    SimulatorInterface::attach(&interface, feed, &mut scheduler);

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let order_cb = Rc::clone(&order);
    interface
        .borrow_mut()
        .set_callback(TelegramId::RequestStatus.tag(), move |_| {
            order_cb.borrow_mut().push("telemetry")
        });

    let order_step = Rc::clone(&order);
    scheduler
        .add_step(0.6, move |_: &mut ScenarioScheduler| {
            order_step.borrow_mut().push("late step")
        })
        .unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut obis = TcpStream::connect(obis_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        obis.write_all(&Telegram::request_status().encode().unwrap()).await.unwrap();
        // Hold the link open until the scenario is over.
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(obis);
    });

    scheduler.play().await;

    // The callback fired while the 0.6s step was still pending.
    assert_eq!(*order.borrow(), vec!["telemetry", "late step"]);
    handle.stop();
    assert!(bridge.await.unwrap().is_ok());
}
