//! Text-format parser for the linear IR.
//!
//! Parses the format produced by `IrFunc`'s `Display` back into an
//! [`IrFunc`]. Two passes: parse text → AST, then resolve references →
//! `IrFunc`. Pass tests are written as text fixtures against this parser.

use std::collections::HashMap;

use chumsky::prelude::*;

use crate::ir::{BlockId, Cond, IrFunc, IrOp, NodeId, OffsetType, Ref, ShiftType, Width};

// ─── AST types (first pass) ─────────────────────────────────────────────────

/// A parsed operand (unresolved).
#[derive(Debug, Clone)]
enum AstArg {
    /// `_` — absent operand
    Invalid,
    /// `%7` — node reference
    Node(u32),
}

/// A parsed node (unresolved operands).
#[derive(Debug, Clone)]
struct AstNode {
    id: u32,
    op: IrOp,
    width: Width,
    args: Vec<AstArg>,
}

/// A parsed block.
#[derive(Debug, Clone)]
struct AstBlock {
    id: u32,
    nodes: Vec<AstNode>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Parse a u32 decimal number.
fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

/// Parse a u8 decimal number.
fn uint8<'src>() -> impl Parser<'src, &'src str, u8, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u8>().unwrap())
}

/// Parse a u64, hex (`0x...`) or decimal.
fn uint64<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    let hex = just("0x")
        .ignore_then(text::int::<_, Extra<'_>>(16))
        .map(|s: &str| u64::from_str_radix(s, 16).unwrap());
    let dec = text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u64>().unwrap());
    hex.or(dec)
}

/// Parse an i64 with optional leading minus.
fn int64<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just("-")
        .or_not()
        .then(uint64())
        .map(|(neg, v)| if neg.is_some() { -(v as i64) } else { v as i64 })
}

fn width<'src>() -> impl Parser<'src, &'src str, Width, Extra<'src>> + Clone {
    choice((
        just("W16").to(Width::W16),
        just("W32").to(Width::W32),
        just("W1").to(Width::W1),
        just("W2").to(Width::W2),
        just("W4").to(Width::W4),
        just("W8").to(Width::W8),
    ))
}

fn cond<'src>() -> impl Parser<'src, &'src str, Cond, Extra<'src>> + Clone {
    choice((
        just("eq").to(Cond::Eq),
        just("neq").to(Cond::Neq),
        just("ult").to(Cond::Ult),
        just("uge").to(Cond::Uge),
        just("slt").to(Cond::Slt),
        just("sge").to(Cond::Sge),
    ))
}

fn shift_type<'src>() -> impl Parser<'src, &'src str, ShiftType, Extra<'src>> + Clone {
    choice((
        just("lsl").to(ShiftType::Lsl),
        just("lsr").to(ShiftType::Lsr),
        just("asr").to(ShiftType::Asr),
        just("ror").to(ShiftType::Ror),
    ))
}

fn offset_type<'src>() -> impl Parser<'src, &'src str, OffsetType, Extra<'src>> + Clone {
    choice((
        just("sxtx").to(OffsetType::Sxtx),
        just("sxtw").to(OffsetType::Sxtw),
        just("uxtw").to(OffsetType::Uxtw),
    ))
}

/// Parse a block reference: `@3`.
fn block_ref<'src>() -> impl Parser<'src, &'src str, BlockId, Extra<'src>> + Clone {
    just("@").ignore_then(uint32()).map(BlockId::new)
}

/// Parse a comma-separated list inside brackets.
fn bracketed_list<'src, T: 'src>(
    inner: impl Parser<'src, &'src str, T, Extra<'src>> + Clone,
) -> impl Parser<'src, &'src str, Vec<T>, Extra<'src>> + Clone {
    inner
        .separated_by(just(",").padded_by(ws()))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just("[").then(ws()), ws().then(just("]")))
}

/// Parse an IrOp (the operation name with parameters).
fn ir_op<'src>() -> impl Parser<'src, &'src str, IrOp, Extra<'src>> + Clone {
    let const_ops = choice((
        just("Constant(")
            .ignore_then(uint64())
            .then_ignore(just(")"))
            .map(|v| IrOp::Constant { value: v }),
        just("InlineConstant(")
            .ignore_then(uint64())
            .then_ignore(just(")"))
            .map(|v| IrOp::InlineConstant { value: v }),
        just("EntrypointOffset(offset=")
            .ignore_then(int64())
            .then_ignore(just(")"))
            .map(|o| IrOp::EntrypointOffset { offset: o }),
        just("InlineEntrypointOffset(offset=")
            .ignore_then(int64())
            .then_ignore(just(")"))
            .map(|o| IrOp::InlineEntrypointOffset { offset: o }),
    ));

    // Longer names before their prefixes.
    let arith_ops = choice((
        just("AddWithFlags").to(IrOp::AddWithFlags),
        just("AddNzcv").to(IrOp::AddNzcv),
        just("Add").to(IrOp::Add),
        just("SubWithFlags").to(IrOp::SubWithFlags),
        just("SubNzcv").to(IrOp::SubNzcv),
        just("SubShift(")
            .ignore_then(shift_type())
            .then_ignore(just(",").then(ws()).then(just("amount=")))
            .then(uint8())
            .then_ignore(just(")"))
            .map(|(shift, amount)| IrOp::SubShift { shift, amount }),
        just("Sub").to(IrOp::Sub),
        just("AdcWithFlags").to(IrOp::AdcWithFlags),
        just("Adc").to(IrOp::Adc),
        just("RmifNzcv(rotate=")
            .ignore_then(uint8())
            .then_ignore(just(")"))
            .map(|rotate| IrOp::RmifNzcv { rotate }),
        just("CondAddNzcv(")
            .ignore_then(cond())
            .then_ignore(just(")"))
            .map(|c| IrOp::CondAddNzcv { cond: c }),
        just("CondSubNzcv(")
            .ignore_then(cond())
            .then_ignore(just(")"))
            .map(|c| IrOp::CondSubNzcv { cond: c }),
        just("Neg").to(IrOp::Neg),
        just("Mul").to(IrOp::Mul),
    ));

    let logic_ops = choice((
        just("AndWithFlags").to(IrOp::AndWithFlags),
        just("Andn").to(IrOp::Andn),
        just("And").to(IrOp::And),
        just("Orlshl(shift=")
            .ignore_then(uint8())
            .then_ignore(just(")"))
            .map(|shift| IrOp::Orlshl { shift }),
        just("Orlshr(shift=")
            .ignore_then(uint8())
            .then_ignore(just(")"))
            .map(|shift| IrOp::Orlshr { shift }),
        just("Or").to(IrOp::Or),
        just("Xor").to(IrOp::Xor),
    ));

    let shift_ops = choice((
        just("Lshl").to(IrOp::Lshl),
        just("Lshr").to(IrOp::Lshr),
        just("Ashr").to(IrOp::Ashr),
        just("Ror").to(IrOp::Ror),
    ));

    let bitfield_ops = choice((
        just("Bfe(lsb=")
            .ignore_then(uint8())
            .then_ignore(just(",").then(ws()).then(just("width=")))
            .then(uint8())
            .then_ignore(just(")"))
            .map(|(lsb, width)| IrOp::Bfe { lsb, width }),
        just("Sbfe(lsb=")
            .ignore_then(uint8())
            .then_ignore(just(",").then(ws()).then(just("width=")))
            .then(uint8())
            .then_ignore(just(")"))
            .map(|(lsb, width)| IrOp::Sbfe { lsb, width }),
        just("Bfi(lsb=")
            .ignore_then(uint8())
            .then_ignore(just(",").then(ws()).then(just("width=")))
            .then(uint8())
            .then_ignore(just(")"))
            .map(|(lsb, width)| IrOp::Bfi { lsb, width }),
    ));

    let select_ops = choice((
        just("TestNz").to(IrOp::TestNz),
        just("Select(")
            .ignore_then(cond())
            .then_ignore(just(")"))
            .map(|c| IrOp::Select { cond: c }),
        just("NzcvSelect(")
            .ignore_then(cond())
            .then_ignore(just(")"))
            .map(|c| IrOp::NzcvSelect { cond: c }),
    ));

    let ctrl_ops = choice((
        just("CondJump(")
            .ignore_then(cond())
            .then_ignore(just(",").then(ws()))
            .then(block_ref())
            .then_ignore(just(",").then(ws()))
            .then(block_ref())
            .then_ignore(just(")"))
            .map(|((c, taken), not_taken)| IrOp::CondJump {
                cond: c,
                taken,
                not_taken,
            }),
        just("Jump(")
            .ignore_then(block_ref())
            .then_ignore(just(")"))
            .map(|target| IrOp::Jump { target }),
        just("ExitFunction").to(IrOp::ExitFunction),
    ));

    let mem_ops = choice((
        just("LoadMemTso(")
            .ignore_then(offset_type())
            .then_ignore(just(")"))
            .map(|o| IrOp::LoadMemTso { offset_type: o }),
        just("LoadMem(")
            .ignore_then(offset_type())
            .then_ignore(just(")"))
            .map(|o| IrOp::LoadMem { offset_type: o }),
        just("LoadContext(offset=")
            .ignore_then(uint32())
            .then_ignore(just(")"))
            .map(|offset| IrOp::LoadContext { offset }),
        just("StoreMemTso(")
            .ignore_then(offset_type())
            .then_ignore(just(")"))
            .map(|o| IrOp::StoreMemTso { offset_type: o }),
        just("StoreMem(")
            .ignore_then(offset_type())
            .then_ignore(just(")"))
            .map(|o| IrOp::StoreMem { offset_type: o }),
        just("Prefetch(")
            .ignore_then(offset_type())
            .then_ignore(just(")"))
            .map(|o| IrOp::Prefetch { offset_type: o }),
        just("MemCpy").to(IrOp::MemCpy),
        just("MemSet").to(IrOp::MemSet),
        just("VMov").to(IrOp::VMov),
    ));

    choice((
        const_ops,
        arith_ops,
        logic_ops,
        shift_ops,
        bitfield_ops,
        select_ops,
        ctrl_ops,
        mem_ops,
    ))
}

/// Parse one node line: `%3 = Add W8 [%0, %1]`.
fn node<'src>() -> impl Parser<'src, &'src str, AstNode, Extra<'src>> + Clone {
    just("%")
        .ignore_then(uint32())
        .then_ignore(ws().then(just("=")).then(ws()))
        .then(ir_op())
        .then_ignore(ws())
        .then(width())
        .then_ignore(ws())
        .then(bracketed_list(arg()))
        .map(|(((id, op), width), args)| AstNode {
            id,
            op,
            width,
            args,
        })
}

fn arg<'src>() -> impl Parser<'src, &'src str, AstArg, Extra<'src>> + Clone {
    choice((
        just("_").to(AstArg::Invalid),
        just("%").ignore_then(uint32()).map(AstArg::Node),
    ))
}

/// Parse one block: `block @0 { ... }`.
fn block<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> + Clone {
    just("block")
        .ignore_then(ws())
        .ignore_then(just("@"))
        .ignore_then(uint32())
        .then_ignore(ws().then(just("{")))
        .then(node().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(ws().then(just("}")))
        .map(|(id, nodes)| AstBlock { id, nodes })
}

fn program<'src>() -> impl Parser<'src, &'src str, Vec<AstBlock>, Extra<'src>> {
    block()
        .padded_by(ws())
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(end())
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

/// Parse error with context.
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse the IR text format into an [`IrFunc`].
///
/// Blocks must appear as `@0, @1, ...` in order. Operand references must
/// point at already-defined nodes; branch targets may point forward.
pub fn parse_ir(input: &str) -> Result<IrFunc, ParseError> {
    let result = program().parse(input);

    let blocks = result.into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        ParseError {
            message: msgs.join("\n"),
        }
    })?;

    resolve(blocks)
}

/// Resolve AST references into a concrete [`IrFunc`].
fn resolve(ast_blocks: Vec<AstBlock>) -> Result<IrFunc, ParseError> {
    let mut ir = IrFunc::new();

    // Create all blocks up front so branch targets can point forward.
    for (index, ast) in ast_blocks.iter().enumerate() {
        if ast.id as usize != index {
            return Err(ParseError {
                message: format!("block @{} out of order (expected @{index})", ast.id),
            });
        }
        ir.create_block();
    }
    let block_count = ast_blocks.len();

    let check_target = |target: BlockId| -> Result<(), ParseError> {
        if target.index() < block_count {
            Ok(())
        } else {
            Err(ParseError {
                message: format!("branch target @{} does not exist", target.index()),
            })
        }
    };

    let mut node_map: HashMap<u32, NodeId> = HashMap::new();
    for (index, ast) in ast_blocks.into_iter().enumerate() {
        let block = BlockId::new(index as u32);
        for ast_node in ast.nodes {
            match &ast_node.op {
                IrOp::Jump { target } => check_target(*target)?,
                IrOp::CondJump {
                    taken, not_taken, ..
                } => {
                    check_target(*taken)?;
                    check_target(*not_taken)?;
                }
                _ => {}
            }

            let args = ast_node
                .args
                .iter()
                .map(|a| match a {
                    AstArg::Invalid => Ok(Ref::Invalid),
                    AstArg::Node(n) => {
                        node_map.get(n).copied().map(Ref::Node).ok_or(ParseError {
                            message: format!("%{n} referenced before definition"),
                        })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;

            let id = ir.push(block, ast_node.op, ast_node.width, args);
            if node_map.insert(ast_node.id, id).is_some() {
                return Err(ParseError {
                    message: format!("duplicate node id %{}", ast_node.id),
                });
            }
        }
    }

    Ok(ir)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_block() {
        let ir = parse_ir(
            r#"
block @0 {
  %0 = Constant(0x5) W8 []
  %1 = Constant(0x7) W8 []
  %2 = Add W8 [%0, %1]
}
"#,
        )
        .unwrap();

        assert_eq!(ir.block_order.len(), 1);
        assert_eq!(ir.nodes.len(), 3);
        let add = NodeId::new(2);
        assert_eq!(ir.node(add).op, IrOp::Add);
        assert_eq!(ir.node(add).width, Width::W8);
        assert_eq!(
            ir.node(add).args,
            vec![Ref::Node(NodeId::new(0)), Ref::Node(NodeId::new(1))]
        );
    }

    #[test]
    fn parses_payload_ops() {
        let ir = parse_ir(
            r#"
block @0 {
  %0 = Constant(0x1000) W8 []
  %1 = LoadMem(sxtx) W4 [%0, _]
  %2 = Bfe(lsb=4, width=8) W4 [%1]
  %3 = SubShift(lsl, amount=3) W8 [%1, %2]
  %4 = Select(uge) W8 [%1, %2, %3, %0]
  %5 = StoreMem(uxtw) W4 [%0, %2, _]
  %6 = EntrypointOffset(offset=-16) W4 []
}
"#,
        )
        .unwrap();

        assert_eq!(
            ir.node(NodeId::new(1)).op,
            IrOp::LoadMem {
                offset_type: OffsetType::Sxtx
            }
        );
        assert_eq!(ir.node(NodeId::new(2)).op, IrOp::Bfe { lsb: 4, width: 8 });
        assert_eq!(
            ir.node(NodeId::new(3)).op,
            IrOp::SubShift {
                shift: ShiftType::Lsl,
                amount: 3
            }
        );
        assert_eq!(ir.node(NodeId::new(4)).op, IrOp::Select { cond: Cond::Uge });
        assert_eq!(ir.node(NodeId::new(5)).args[2], Ref::Invalid);
        assert_eq!(
            ir.node(NodeId::new(6)).op,
            IrOp::EntrypointOffset { offset: -16 }
        );
    }

    #[test]
    fn parses_branches_across_blocks() {
        let ir = parse_ir(
            r#"
block @0 {
  %0 = Constant(0x1) W8 []
  %1 = LoadContext(offset=0) W8 []
  %2 = CondJump(eq, @1, @2) W8 [%1, %0]
}
block @1 {
  %3 = Jump(@2) W8 []
}
block @2 {
  %4 = ExitFunction W8 [%0]
}
"#,
        )
        .unwrap();

        assert_eq!(ir.block_order.len(), 3);
        assert_eq!(
            ir.node(NodeId::new(2)).op,
            IrOp::CondJump {
                cond: Cond::Eq,
                taken: BlockId::new(1),
                not_taken: BlockId::new(2),
            }
        );
    }

    #[test]
    fn round_trips_through_display() {
        let text = r#"
block @0 {
  %0 = Constant(0x2a) W8 []
  %1 = LoadMemTso(sxtx) W4 [%0, _]
  %2 = Orlshl(shift=3) W8 [%1, %0]
  %3 = NzcvSelect(slt) W4 [%2, %0]
}
"#;
        let ir = parse_ir(text).unwrap();
        let printed = ir.to_string();
        let reparsed = parse_ir(&printed).unwrap();
        assert_eq!(printed, reparsed.to_string());
    }

    #[test]
    fn rejects_use_before_definition() {
        let err = parse_ir(
            r#"
block @0 {
  %0 = Neg W8 [%1]
  %1 = Constant(0x1) W8 []
}
"#,
        )
        .unwrap_err();
        assert!(err.message.contains("%1 referenced before definition"));
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_targets() {
        let err = parse_ir(
            r#"
block @0 {
  %0 = Constant(0x1) W8 []
  %0 = Constant(0x2) W8 []
}
"#,
        )
        .unwrap_err();
        assert!(err.message.contains("duplicate node id %0"));

        let err = parse_ir(
            r#"
block @0 {
  %0 = Jump(@7) W8 []
}
"#,
        )
        .unwrap_err();
        assert!(err.message.contains("branch target @7 does not exist"));
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(parse_ir("block @0 {\n  %0 = Frobnicate W8 []\n}").is_err());
    }
}
