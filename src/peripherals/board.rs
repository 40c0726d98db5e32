//! User button and the four user LEDs of the STM32F4-Discovery.

use embassy_stm32::{
    gpio::{Input, Level, Output, Pull, Speed},
    peripherals::{PA0, PD12, PD13, PD14, PD15},
    Peri,
};

use acc_logger::apps::StatusLeds;

/// Peripheral collection for the button and LEDs
pub struct BoardPeripherals<'d> {
    pub button: Peri<'d, PA0>,  // B1, high while pressed
    pub green: Peri<'d, PD12>,  // LD4
    pub orange: Peri<'d, PD13>, // LD3
    pub red: Peri<'d, PD14>,    // LD5
    pub blue: Peri<'d, PD15>,   // LD6
}

/// Macro to claim the button and LED pins
#[macro_export]
macro_rules! claim_board {
    ($peripherals:expr) => {{
        $crate::peripherals::board::BoardPeripherals {
            button: $peripherals.PA0,
            green: $peripherals.PD12,
            orange: $peripherals.PD13,
            red: $peripherals.PD14,
            blue: $peripherals.PD15,
        }
    }};
}

pub struct Board<'d> {
    pub button: Input<'d>,
    pub leds: StatusLeds<Output<'d>>,
}

impl<'d> Board<'d> {
    /// Configure the button input and the LED outputs
    ///
    /// # Arguments
    /// * `peripherals` - BoardPeripherals struct with the button and LED pins
    ///
    /// # Returns
    /// The board I/O with all LEDs off
    pub fn new(peripherals: BoardPeripherals<'d>) -> Self {
        Self {
            button: Input::new(peripherals.button, Pull::Down),
            leds: StatusLeds {
                orange: Output::new(peripherals.orange, Level::Low, Speed::Low),
                green: Output::new(peripherals.green, Level::Low, Speed::Low),
                red: Output::new(peripherals.red, Level::Low, Speed::Low),
                blue: Output::new(peripherals.blue, Level::Low, Speed::Low),
            },
        }
    }
}
