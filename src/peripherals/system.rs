//! System initialization and clock configuration for the STM32F407.

use embassy_stm32::{rcc::*, time::Hertz, Config, Peripherals};

/// Initialize the STM32F407 with the Discovery board clock tree.
///
/// - **168 MHz** system clock from PLL1 fed by the 8 MHz crystal
/// - **42 MHz** APB1 and **84 MHz** APB2
/// - **48 MHz** PLL1 Q output for the OTG FS core
pub fn init_system() -> Peripherals {
    let mut config = Config::default();

    config.rcc.hse = Some(Hse {
        freq: Hertz(8_000_000),
        mode: HseMode::Oscillator,
    });

    // PLL1 = HSE(8MHz) / M(8) * N(336) = 336MHz VCO, /P(2) = 168MHz, /Q(7) = 48MHz
    config.rcc.pll_src = PllSource::HSE;
    config.rcc.pll = Some(Pll {
        prediv: PllPreDiv::DIV8,
        mul: PllMul::MUL336,
        divp: Some(PllPDiv::DIV2),
        divq: Some(PllQDiv::DIV7),
        divr: None,
    });

    config.rcc.sys = Sysclk::PLL1_P;
    config.rcc.ahb_pre = AHBPrescaler::DIV1;
    config.rcc.apb1_pre = APBPrescaler::DIV4;
    config.rcc.apb2_pre = APBPrescaler::DIV2;

    config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;

    embassy_stm32::init(config)
}
