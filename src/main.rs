//! nRF52840 BLE mouse with MRU-ranked reconnection.
//!
//! Task layout:
//!   - `softdevice_task`: SoftDevice event pump.
//!   - `tick_task`: 1 ms tick on an interrupt executor, feeds the timer pool.
//!   - `advertising_task`: runs advertising windows and holds the live link.
//!   - `button` (x4): debounced GPIO buttons.
//!   - `main`: owns the controller and the scheduler and drives both.

#![no_std]
#![no_main]

use defmt::{error, info, warn};
use defmt_rtt as _;
use panic_probe as _;

use embassy_executor::{InterruptExecutor, Spawner};
use embassy_nrf::gpio::{AnyPin, Pin};
use embassy_nrf::interrupt;
use embassy_nrf::interrupt::{InterruptExt, Priority};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker, Timer};
use nrf_softdevice::{raw, Softdevice};
use static_cell::StaticCell;

use ble_reconnect::ble::softdevice::{
    self, ActiveLink, AdvCommand, Bonder, SoftdeviceRadio, ADV_COMMAND_DEPTH, RADIO_EVENT_DEPTH,
};
use ble_reconnect::config::{RECORD_KEY_ORDER, TICK_PERIOD_MS};
use ble_reconnect::input::{self, buttons, Button, ButtonEvent};
use ble_reconnect::storage::FlashRecordStore;
use ble_reconnect::{
    Controller, Error, OrderPool, RadioEvent, SaveRetry, SaveStep, Scheduler, TimerPool,
};

static TIMERS: TimerPool = TimerPool::new();
static ACTIVE_LINK: ActiveLink = ActiveLink::new();

static RADIO_EVENTS: Channel<CriticalSectionRawMutex, RadioEvent, RADIO_EVENT_DEPTH> =
    Channel::new();
static ADV_COMMANDS: Channel<CriticalSectionRawMutex, AdvCommand, ADV_COMMAND_DEPTH> =
    Channel::new();
static BUTTONS: Channel<CriticalSectionRawMutex, ButtonEvent, 4> = Channel::new();

static BONDER: StaticCell<Bonder> = StaticCell::new();
static ORDER_POOL: StaticCell<OrderPool> = StaticCell::new();

static TICK_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn EGU1_SWI1() {
    TICK_EXECUTOR.on_interrupt()
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ble-reconnect starting");

    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);

    let sd: &'static Softdevice = Softdevice::enable(&softdevice_config());
    spawner.must_spawn(softdevice_task(sd));

    interrupt::EGU1_SWI1.set_priority(Priority::P6);
    let tick_spawner = TICK_EXECUTOR.start(interrupt::EGU1_SWI1);
    tick_spawner.must_spawn(tick_task(&TIMERS));

    spawner.must_spawn(button(p.P0_11.degrade(), Button::Left));
    spawner.must_spawn(button(p.P0_12.degrade(), Button::Up));
    spawner.must_spawn(button(p.P0_24.degrade(), Button::EraseBonds));
    spawner.must_spawn(button(p.P0_25.degrade(), Button::Pair));

    let bonder: &'static Bonder = BONDER.init(Bonder::new(RADIO_EVENTS.sender()));
    spawner.must_spawn(advertising_task(sd, bonder));

    let mut flash = nrf_softdevice::Flash::take(sd);
    let mut store = FlashRecordStore::new();
    store.load_from_flash(&mut flash, &[RECORD_KEY_ORDER]).await;

    let pool: &'static mut OrderPool = ORDER_POOL.init(OrderPool::new());
    let Some(slot) = pool.alloc() else {
        fatal(Error::OrderPoolExhausted);
    };
    let order = pool.get_mut(&slot);

    // The HID GATT service is registered elsewhere; no report handle means movement is dropped.
    let radio = SoftdeviceRadio::new(bonder, &ACTIVE_LINK, ADV_COMMANDS.sender(), None);

    let mut scheduler = Scheduler::new(&TIMERS);
    let mut controller = match Controller::new(radio, store, order, &mut scheduler) {
        Ok(controller) => controller,
        Err(e) => fatal(e),
    };
    report(controller.start());

    let events = RADIO_EVENTS.receiver();
    let presses = BUTTONS.receiver();
    let mut save_retry = SaveRetry::new();

    loop {
        while let Ok(event) = events.try_receive() {
            report(controller.handle_event(event));
        }
        while let Ok(press) = presses.try_receive() {
            report(controller.request(input::request_for(press)));
        }

        report(controller.tick());
        scheduler.step(&mut controller);

        if controller.store().is_dirty() {
            let saved = controller.store_mut().save_to_flash(&mut flash).await;
            match save_retry.record(saved) {
                SaveStep::Done | SaveStep::Retry => {}
                SaveStep::Collect => report(controller.handle_event(RadioEvent::StorageFull)),
                SaveStep::GiveUp(e) => {
                    controller.store_mut().discard_pending();
                    report(Err(Error::Storage(e)));
                }
            }
        }

        Timer::after_millis(u64::from(TICK_PERIOD_MS)).await;
    }
}

fn report(result: Result<(), Error>) {
    if let Err(e) = result {
        if e.is_fatal() {
            fatal(e);
        }
        warn!("Storage fault: {}", e);
    }
}

fn fatal(e: Error) -> ! {
    error!("Fatal: {}", e);
    defmt::panic!("unrecoverable radio or pool error");
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: b"BLE Mouse" as *const u8 as _,
            current_len: 9,
            max_len: 9,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    }
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn tick_task(timers: &'static TimerPool) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(u64::from(TICK_PERIOD_MS)));
    loop {
        ticker.next().await;
        timers.on_tick();
    }
}

#[embassy_executor::task]
async fn advertising_task(sd: &'static Softdevice, bonder: &'static Bonder) -> ! {
    softdevice::advertising_task(
        sd,
        bonder,
        &ACTIVE_LINK,
        ADV_COMMANDS.receiver(),
        RADIO_EVENTS.sender(),
    )
    .await
}

#[embassy_executor::task(pool_size = 4)]
async fn button(pin: AnyPin, which: Button) -> ! {
    let tx = BUTTONS.sender();
    buttons::button_task(pin, which, &tx).await
}
