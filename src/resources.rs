pub mod capi;
pub mod controlplane;
pub mod k0smotron;
