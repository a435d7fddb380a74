pub mod arch;
pub mod const_prop;
pub mod ir;
pub mod ir_parse;

pub use const_prop::ConstProp;
pub use ir::{IrFunc, IrOp, Ref, Width};
pub use ir_parse::parse_ir;
