mod common;

use common::{device, heart_rate_service, session, within, BATTERY, HEART_RATE};
use futures::{FutureExt, StreamExt};
use reactive_bluetooth::{
  fake::{CentralCommand, FakeCentral, FakePeripheral, PeripheralCommand},
  host::{HostPeripheral, PeripheralDelegate},
  uuid_from_u16, AdvertisementData, CentralSession, CentralState, ConnectOptions, Error, HostError, Peripheral,
  PeripheralConnectionEvent, SessionConfig, StateRestorationEvent,
};

fn scans(central: &FakeCentral) -> usize {
  central.count(|command| matches!(command, CentralCommand::ScanForPeripherals { .. }))
}

fn stops(central: &FakeCentral) -> usize {
  central.count(|command| matches!(command, CentralCommand::StopScan))
}

fn cancels(central: &FakeCentral) -> usize {
  central.count(|command| matches!(command, CentralCommand::CancelConnection(_)))
}

#[tokio::test]
async fn state_stream_replays_the_latest_state() {
  let (central, session) = session();
  central.set_state(CentralState::PoweredOff);
  assert_eq!(session.current_state(), CentralState::PoweredOff);

  let mut state = session.state();
  assert_eq!(within(state.next()).await.unwrap().unwrap(), CentralState::PoweredOff);
  central.set_state(CentralState::PoweredOff);
  central.set_state(CentralState::PoweredOn);
  assert_eq!(within(state.next()).await.unwrap().unwrap(), CentralState::PoweredOn);
  assert!(state.next().now_or_never().is_none());
}

#[tokio::test]
async fn scanning_starts_on_demand_and_stops_on_drop() {
  let (central, session) = session();
  let mut scanning = session.is_scanning();
  assert!(!within(scanning.next()).await.unwrap().unwrap());

  let mut scan = session.scan();
  assert_eq!(scans(&central), 0);
  assert!(scan.next().now_or_never().is_none());
  assert_eq!(scans(&central), 1);
  assert!(within(scanning.next()).await.unwrap().unwrap());

  drop(scan);
  assert_eq!(stops(&central), 1);
  assert!(!within(scanning.next()).await.unwrap().unwrap());
}

#[tokio::test]
async fn scan_uses_the_configured_filter() {
  let central = FakeCentral::new(CentralState::PoweredOn);
  let config = SessionConfig::from_json(r#"{ "scanServices": ["180d"], "allowDuplicates": true }"#).unwrap();
  let session = CentralSession::new(central.clone(), config);

  let mut scan = session.scan();
  assert!(scan.next().now_or_never().is_none());
  match central.commands().first() {
    Some(CentralCommand::ScanForPeripherals { services, options }) => {
      assert_eq!(services.as_deref(), Some(&[uuid_from_u16(HEART_RATE)][..]));
      assert!(options.allow_duplicates);
    }
    other => panic!("unexpected command {other:?}"),
  }
}

#[tokio::test]
async fn observations_share_identity_with_retrieved_handles() {
  let (central, session) = session();
  let (fake, retrieved) = device(&central, &session, "strap");

  let mut scan = session.scan();
  assert!(scan.next().now_or_never().is_none());
  let advertisement = AdvertisementData {
    local_name: Some("strap".into()),
    ..AdvertisementData::default()
  };
  central.advertise(&fake, advertisement.clone(), -61);
  central.advertise(&fake, advertisement, -58);

  let first = within(scan.next()).await.unwrap().unwrap();
  let second = within(scan.next()).await.unwrap().unwrap();
  assert!(Peripheral::ptr_eq(&first.peripheral, &retrieved));
  assert!(Peripheral::ptr_eq(&second.peripheral, &retrieved));
  assert_eq!(first.rssi, -61);
  assert_eq!(first.advertisement.local_name.as_deref(), Some("strap"));
  assert_eq!(fake.delegate_installs(), 1);
}

#[tokio::test]
async fn a_newer_scan_replaces_the_older_one() {
  let (central, session) = session();
  let mut older = session.scan();
  assert!(older.next().now_or_never().is_none());
  let mut newer = session.scan();
  assert!(newer.next().now_or_never().is_none());
  assert_eq!(scans(&central), 2);

  assert!(within(older.next()).await.is_none());
  drop(older);
  assert_eq!(stops(&central), 0);

  drop(newer);
  assert_eq!(stops(&central), 1);
}

#[tokio::test]
async fn losing_the_delegate_ends_state_and_scan_streams() {
  let (central, session) = session();
  let mut state = session.state();
  let mut scan = session.scan();
  assert_eq!(within(state.next()).await.unwrap().unwrap(), CentralState::PoweredOn);
  assert!(scan.next().now_or_never().is_none());

  central.steal_delegate();
  assert!(!session.is_delegate());

  assert!(matches!(within(state.next()).await, Some(Err(Error::DelegateOwnershipLost))));
  assert!(matches!(within(scan.next()).await, Some(Err(Error::DelegateOwnershipLost))));
  assert!(within(state.next()).await.is_none());
  assert!(within(scan.next()).await.is_none());
  assert_eq!(stops(&central), 0);
}

#[tokio::test]
async fn streams_opened_without_the_delegate_fail_at_once() {
  let (central, session) = session();
  central.steal_delegate();
  let mut restoration = session.state_restoration();
  assert!(matches!(within(restoration.next()).await, Some(Err(Error::DelegateOwnershipLost))));

  session.restore_delegation();
  assert!(session.is_delegate());
  central.set_state(CentralState::Resetting);
  let mut state = session.state();
  assert_eq!(within(state.next()).await.unwrap().unwrap(), CentralState::Resetting);
}

#[tokio::test]
async fn connect_resolves_with_the_canonical_handle() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");
  let (other, _) = device(&central, &session, "scale");

  let mut connect = Box::pin(session.connect(&peripheral, ConnectOptions::default()));
  assert!(central.commands().is_empty());
  assert!(connect.as_mut().now_or_never().is_none());
  assert!(matches!(
    central.commands().as_slice(),
    [CentralCommand::Connect { peripheral: id, .. }] if *id == peripheral.id()
  ));

  central.complete_connection(&other);
  assert!(connect.as_mut().now_or_never().is_none());

  central.complete_connection(&fake);
  let connected = within(connect).await.unwrap();
  assert!(Peripheral::ptr_eq(&connected, &peripheral));
  assert_eq!(cancels(&central), 0);
}

#[tokio::test]
async fn connect_reports_failures_of_its_own_device() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");

  let mut failing = Box::pin(session.connect(&peripheral, ConnectOptions::default()));
  assert!(failing.as_mut().now_or_never().is_none());
  central.fail_connection(&fake, Some(HostError::new(14, "peer removed pairing")));
  match within(failing).await {
    Err(Error::FailedToConnect { peripheral: failed, cause }) => {
      assert!(Peripheral::ptr_eq(&failed, &peripheral));
      assert_eq!(cause.map(|cause| cause.code), Some(14));
    }
    other => panic!("unexpected outcome {other:?}"),
  }

  let mut dropped = Box::pin(session.connect(&peripheral, ConnectOptions::default()));
  assert!(dropped.as_mut().now_or_never().is_none());
  central.drop_connection(&fake, None);
  assert!(matches!(within(dropped).await, Err(Error::LostConnection { cause: None, .. })));
  assert_eq!(cancels(&central), 0);
}

#[tokio::test]
async fn a_drop_queued_behind_the_connect_event_fails_the_connect() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");

  for _ in 0..64 {
    let mut connect = Box::pin(session.connect(&peripheral, ConnectOptions::default()));
    assert!(connect.as_mut().now_or_never().is_none());
    central.complete_connection(&fake);
    central.drop_connection(&fake, Some(HostError::new(8, "supervision timeout")));
    match within(connect).await {
      Err(Error::LostConnection { cause, .. }) => assert_eq!(cause.map(|cause| cause.code), Some(8)),
      other => panic!("unexpected outcome {other:?}"),
    }
  }

  let mut connection = session.connection(&peripheral, ConnectOptions::default());
  assert!(connection.next().now_or_never().is_none());
  central.complete_connection(&fake);
  central.drop_connection(&fake, None);
  assert!(matches!(within(connection.next()).await, Some(Err(Error::LostConnection { .. }))));
  assert!(within(connection.next()).await.is_none());
}

#[tokio::test]
async fn dropping_a_pending_connect_cancels_it_once() {
  let (central, session) = session();
  let (_fake, peripheral) = device(&central, &session, "strap");

  let unpolled = session.connect(&peripheral, ConnectOptions::default());
  drop(unpolled);
  assert!(central.commands().is_empty());

  let mut connect = Box::pin(session.connect(&peripheral, ConnectOptions::default()));
  assert!(connect.as_mut().now_or_never().is_none());
  drop(connect);
  assert_eq!(cancels(&central), 1);
}

#[tokio::test]
async fn connection_stream_fails_when_the_link_drops() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");

  let mut connection = session.connection(&peripheral, ConnectOptions::default());
  assert!(connection.next().now_or_never().is_none());
  central.complete_connection(&fake);
  let connected = within(connection.next()).await.unwrap().unwrap();
  assert!(Peripheral::ptr_eq(&connected, &peripheral));

  central.drop_connection(&fake, Some(HostError::new(8, "supervision timeout")));
  assert!(matches!(
    within(connection.next()).await,
    Some(Err(Error::LostConnection { cause: Some(_), .. }))
  ));
  assert!(within(connection.next()).await.is_none());
  drop(connection);
  assert_eq!(cancels(&central), 0);
}

#[tokio::test]
async fn dropping_an_open_connection_disconnects() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");

  let mut connection = session.connection(&peripheral, ConnectOptions::default());
  assert!(connection.next().now_or_never().is_none());
  central.complete_connection(&fake);
  assert!(within(connection.next()).await.unwrap().is_ok());
  drop(connection);
  assert_eq!(cancels(&central), 1);
}

#[tokio::test]
async fn handles_from_another_session_are_rejected() {
  let (central, session) = session();
  let (other_central, other_session) = common::session();
  let (_fake, foreign) = device(&other_central, &other_session, "strap");

  let outcome = within(session.connect(&foreign, ConnectOptions::default())).await;
  assert!(matches!(outcome, Err(Error::WrapperTypeMismatch { .. })));
  assert!(matches!(session.disconnect(&foreign), Err(Error::WrapperTypeMismatch { .. })));
  assert!(central.commands().is_empty());
}

#[tokio::test]
async fn connectivity_events_are_mapped_to_handles() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");
  let mut events = session.peripheral_connection();

  central.complete_connection(&fake);
  match within(events.next()).await {
    Some(Ok(PeripheralConnectionEvent::Connected(connected))) => assert!(Peripheral::ptr_eq(&connected, &peripheral)),
    other => panic!("unexpected event {other:?}"),
  }
  central.drop_connection(&fake, None);
  let event = within(events.next()).await.unwrap().unwrap();
  assert!(matches!(event, PeripheralConnectionEvent::Disconnected { error: None, .. }));
  assert!(Peripheral::ptr_eq(event.peripheral(), &peripheral));
}

#[tokio::test]
async fn restored_peripherals_go_through_the_cache() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");
  let mut restoration = session.state_restoration();

  central.restore(&[fake.clone()], Some(vec![uuid_from_u16(BATTERY)]));
  let StateRestorationEvent::WillRestoreState(restored) = within(restoration.next()).await.unwrap().unwrap();
  assert_eq!(restored.peripherals.len(), 1);
  assert!(Peripheral::ptr_eq(&restored.peripherals[0], &peripheral));
  assert_eq!(restored.scan_services, Some(vec![uuid_from_u16(BATTERY)]));
}

#[tokio::test]
async fn connected_peripherals_are_retrieved_by_service() {
  let (central, session) = session();
  let (fake, peripheral) = device(&central, &session, "strap");
  fake.set_services(vec![heart_rate_service(&peripheral)]);

  assert!(session.retrieve_connected_peripherals(&[uuid_from_u16(HEART_RATE)]).is_empty());
  central.complete_connection(&fake);
  let connected = session.retrieve_connected_peripherals(&[uuid_from_u16(HEART_RATE)]);
  assert_eq!(connected.len(), 1);
  assert!(Peripheral::ptr_eq(&connected[0], &peripheral));
  assert!(session.peripheral(&peripheral.id()).is_some());
}

#[tokio::test]
async fn scan_connect_and_discover_an_allow_listed_service() {
  let (central, session) = session();
  let fake = FakePeripheral::new("strap");

  let mut scan = session.scan();
  assert!(scan.next().now_or_never().is_none());
  central.advertise(&fake, AdvertisementData::default(), -40);
  let observed = within(scan.next()).await.unwrap().unwrap();
  drop(scan);

  let mut connect = Box::pin(session.connect(&observed.peripheral, ConnectOptions::default()));
  assert!(connect.as_mut().now_or_never().is_none());
  central.complete_connection(&fake);
  let peripheral = within(connect).await.unwrap();

  let heart_rate = uuid_from_u16(HEART_RATE);
  let mut services = peripheral.discover_services(Some(vec![heart_rate]));
  assert!(services.next().now_or_never().is_none());
  assert_eq!(
    fake.commands(),
    vec![PeripheralCommand::DiscoverServices(Some(vec![heart_rate]))]
  );
  let reported = vec![
    heart_rate_service(&peripheral),
    reactive_bluetooth::Service::new(fake.id(), uuid_from_u16(BATTERY)),
  ];
  fake.fire(|delegate| delegate.did_discover_services(Ok(reported)));

  let discovered: Vec<_> = within(services.collect::<Vec<_>>()).await;
  assert_eq!(discovered.len(), 1);
  assert_eq!(discovered[0].as_ref().unwrap().uuid, heart_rate);
}
