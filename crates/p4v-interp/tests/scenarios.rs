//! End-to-end interpretation scenarios
//!
//! Each test builds a small typed program the way the front-end exporter
//! would, runs the interpreter, and checks the flattened pipeline state with
//! the solver: the expected relation is asserted negated and must come back
//! unsat.

use std::sync::Arc;

use p4v_interp::run_program;
use p4v_ir::{
    ActionRef, Argument, BinOp, BlockStatement, CallableDecl, ControlDecl, Declaration, Direction,
    Expr, InstanceDecl, KeySetExpr, PackageType, Parameter, ParserDecl, ParserState, PipelineType,
    Program, SelectCase, Statement, StructField, StructType, TableDecl, Transition, Type, VarDecl,
};
use z3::ast::{Ast, Bool, Dynamic, BV};
use z3::{Config, Context, SatResult, Solver};

fn assert_valid(ctx: &Context, expr: &Bool) {
    let solver = Solver::new(ctx);
    solver.assert(&expr.not());
    assert_eq!(solver.check(), SatResult::Unsat);
}

fn header_h() -> Declaration {
    Declaration::Header(Arc::new(StructType {
        name: "H".to_string(),
        fields: vec![StructField {
            name: "a".to_string(),
            ty: Type::bits(8),
        }],
    }))
}

/// A program whose `main` package runs a single control pipeline named `ig`.
fn control_program(
    params: Vec<Parameter>,
    locals: Vec<Declaration>,
    body: Vec<Statement>,
    mut extra: Vec<Declaration>,
) -> Program {
    let mut declarations = Vec::new();
    declarations.append(&mut extra);
    declarations.push(Declaration::Control(Arc::new(ControlDecl {
        name: "MyC".to_string(),
        type_params: vec![],
        params: params.clone(),
        constructor_params: vec![],
        locals,
        body: BlockStatement::new(body),
    })));
    declarations.push(Declaration::ControlType(Arc::new(PipelineType {
        name: "CProto".to_string(),
        type_params: vec![],
        params,
    })));
    declarations.push(Declaration::Package(Arc::new(PackageType {
        name: "Pkg".to_string(),
        type_params: vec![],
        params: vec![Parameter::new(
            "ig",
            Direction::None,
            Type::Name("CProto".to_string()),
        )],
    })));
    declarations.push(Declaration::Instance(Arc::new(InstanceDecl {
        name: "main".to_string(),
        ty: Type::Name("Pkg".to_string()),
        args: vec![Argument::positional(Expr::construct(
            Type::Name("MyC".to_string()),
            vec![],
        ))],
    })));
    Program { declarations }
}

fn find_leaf<'a, 'ctx>(
    leaves: &'a [(String, Dynamic<'ctx>)],
    name: &str,
) -> &'a Dynamic<'ctx> {
    &leaves
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("leaf {name} missing from {leaves:?}"))
        .1
}

#[test]
fn bit_width_narrowing() {
    // bit<8> x = 0xFF; out y = (bit<4>)x  =>  y == 0b1111
    let ctx = Context::new(&Config::new());
    let program = control_program(
        vec![Parameter::new("y", Direction::Out, Type::bits(4))],
        vec![Declaration::Variable(Arc::new(VarDecl {
            name: "x".to_string(),
            ty: Type::bits(8),
            init: Some(Expr::uint(0xFF, 8)),
        }))],
        vec![Statement::Assign {
            target: Expr::path("y"),
            value: Expr::cast(Type::bits(4), Expr::path("x")),
        }],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let leaves = &pipelines["ig"];
    let y = find_leaf(leaves, "y").as_bv().unwrap();
    assert_valid(&ctx, &y._eq(&BV::from_u64(&ctx, 0xF, 4)));
}

#[test]
fn header_validity_gates_reads() {
    // h.setValid(); h.a = 0xAA; h.setInvalid()  =>  h.a flattens to havoc
    let ctx = Context::new(&Config::new());
    let set_call = |method: &str| {
        Statement::MethodCall(Expr::call(
            Expr::member(Expr::path("h"), method),
            vec![],
        ))
    };
    let program = control_program(
        vec![Parameter::new(
            "h",
            Direction::Out,
            Type::Name("H".to_string()),
        )],
        vec![],
        vec![
            set_call("setValid"),
            Statement::Assign {
                target: Expr::member(Expr::path("h"), "a"),
                value: Expr::uint(0xAA, 8),
            },
            set_call("setInvalid"),
        ],
        vec![header_h()],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let leaf = find_leaf(&pipelines["ig"], "h.a").as_bv().unwrap();

    // The assignment must not be recoverable from the flattened state.
    let solver = Solver::new(&ctx);
    solver.assert(&leaf._eq(&BV::from_u64(&ctx, 0xAA, 8)).not());
    assert_eq!(solver.check(), SatResult::Sat);
}

#[test]
fn symbolic_stack_write_fans_out() {
    // stk[0..1].setValid(); stk[i].a = 7 with symbolic one-bit i
    let ctx = Context::new(&Config::new());
    let set_valid = |slot: u64| {
        Statement::MethodCall(Expr::call(
            Expr::member(
                Expr::index(Expr::path("stk"), Expr::uint(slot, 1)),
                "setValid",
            ),
            vec![],
        ))
    };
    let program = control_program(
        vec![
            Parameter::new("i", Direction::In, Type::bits(1)),
            Parameter::new(
                "stk",
                Direction::Out,
                Type::Stack {
                    element: Box::new(Type::Name("H".to_string())),
                    size: 2,
                },
            ),
        ],
        vec![],
        vec![
            set_valid(0),
            set_valid(1),
            Statement::Assign {
                target: Expr::member(
                    Expr::index(Expr::path("stk"), Expr::path("i")),
                    "a",
                ),
                value: Expr::uint(7, 8),
            },
        ],
        vec![header_h()],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let leaves = &pipelines["ig"];

    // The pipeline input i is bound to the named constant i0.
    let input = BV::new_const(&ctx, "i0", 1);
    for slot in 0..2u64 {
        let leaf = find_leaf(leaves, &format!("stk.{slot}.a")).as_bv().unwrap();
        let selected = input._eq(&BV::from_u64(&ctx, slot, 1));
        let is_seven = leaf._eq(&BV::from_u64(&ctx, 7, 8));
        assert_valid(&ctx, &selected.implies(&is_seven));
    }
}

#[test]
fn if_branches_merge_under_condition() {
    // if (c) x = 1 else x = 2  =>  x == ite(c, 1, 2)
    let ctx = Context::new(&Config::new());
    let program = control_program(
        vec![
            Parameter::new("c", Direction::In, Type::Bool),
            Parameter::new("x", Direction::Out, Type::bits(8)),
        ],
        vec![],
        vec![Statement::If {
            condition: Expr::path("c"),
            then_branch: Box::new(Statement::Assign {
                target: Expr::path("x"),
                value: Expr::uint(1, 8),
            }),
            else_branch: Some(Box::new(Statement::Assign {
                target: Expr::path("x"),
                value: Expr::uint(2, 8),
            })),
        }],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();

    let c = Bool::new_const(&ctx, "c0");
    let expected = c.ite(&BV::from_u64(&ctx, 1, 8), &BV::from_u64(&ctx, 2, 8));
    assert_valid(&ctx, &x._eq(&expected));
}

#[test]
fn saturating_add_clamps() {
    // bit<2> x = 3 |+| 3  =>  x == 0b11
    let ctx = Context::new(&Config::new());
    let program = control_program(
        vec![Parameter::new("x", Direction::Out, Type::bits(2))],
        vec![],
        vec![Statement::Assign {
            target: Expr::path("x"),
            value: Expr::binary(BinOp::AddSat, Expr::uint(3, 2), Expr::uint(3, 2)),
        }],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();
    assert_valid(&ctx, &x._eq(&BV::from_u64(&ctx, 3, 2)));
}

#[test]
fn copy_out_writes_out_parameters_back() {
    // action set5(out bit<8> v) { v = 5 }  applied to x  =>  x == 5
    let ctx = Context::new(&Config::new());
    let action = Declaration::Action(Arc::new(CallableDecl {
        name: "set5".to_string(),
        return_type: Type::Void,
        params: vec![Parameter::new("v", Direction::Out, Type::bits(8))],
        body: BlockStatement::new(vec![Statement::Assign {
            target: Expr::path("v"),
            value: Expr::uint(5, 8),
        }]),
    }));
    let program = control_program(
        vec![Parameter::new("x", Direction::Out, Type::bits(8))],
        vec![action],
        vec![Statement::MethodCall(Expr::call(
            Expr::path("set5"),
            vec![Argument::positional(Expr::path("x"))],
        ))],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();
    assert_valid(&ctx, &x._eq(&BV::from_u64(&ctx, 5, 8)));
}

#[test]
fn early_returns_merge_by_path() {
    // bit<8> pick(in bool c) { if (c) return 1; return 2; }
    let ctx = Context::new(&Config::new());
    let function = Declaration::Function(Arc::new(CallableDecl {
        name: "pick".to_string(),
        return_type: Type::bits(8),
        params: vec![Parameter::new("c", Direction::In, Type::Bool)],
        body: BlockStatement::new(vec![
            Statement::If {
                condition: Expr::path("c"),
                then_branch: Box::new(Statement::Return(Some(Expr::uint(1, 8)))),
                else_branch: None,
            },
            Statement::Return(Some(Expr::uint(2, 8))),
        ]),
    }));
    let program = control_program(
        vec![
            Parameter::new("c", Direction::In, Type::Bool),
            Parameter::new("x", Direction::Out, Type::bits(8)),
        ],
        vec![function],
        vec![Statement::Assign {
            target: Expr::path("x"),
            value: Expr::call(
                Expr::path("pick"),
                vec![Argument::positional(Expr::path("c"))],
            ),
        }],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();

    let c = Bool::new_const(&ctx, "c0");
    let expected = c.ite(&BV::from_u64(&ctx, 1, 8), &BV::from_u64(&ctx, 2, 8));
    assert_valid(&ctx, &x._eq(&expected));
}

#[test]
fn exit_freezes_the_state_on_its_path() {
    // x = 1; if (c) exit; x = 2  =>  x == ite(c, 1, 2)
    let ctx = Context::new(&Config::new());
    let program = control_program(
        vec![
            Parameter::new("c", Direction::In, Type::Bool),
            Parameter::new("x", Direction::Out, Type::bits(8)),
        ],
        vec![],
        vec![
            Statement::Assign {
                target: Expr::path("x"),
                value: Expr::uint(1, 8),
            },
            Statement::If {
                condition: Expr::path("c"),
                then_branch: Box::new(Statement::Exit),
                else_branch: None,
            },
            Statement::Assign {
                target: Expr::path("x"),
                value: Expr::uint(2, 8),
            },
        ],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();

    let c = Bool::new_const(&ctx, "c0");
    let expected = c.ite(&BV::from_u64(&ctx, 1, 8), &BV::from_u64(&ctx, 2, 8));
    assert_valid(&ctx, &x._eq(&expected));
}

#[test]
fn table_apply_merges_actions_under_selection() {
    let ctx = Context::new(&Config::new());
    let action = |name: &str, value: u64| {
        Declaration::Action(Arc::new(CallableDecl {
            name: name.to_string(),
            return_type: Type::Void,
            params: vec![],
            body: BlockStatement::new(vec![Statement::Assign {
                target: Expr::path("x"),
                value: Expr::uint(value, 8),
            }]),
        }))
    };
    let table = Declaration::Table(Arc::new(TableDecl {
        name: "t".to_string(),
        keys: vec![],
        actions: vec![
            ActionRef {
                name: "set_one".to_string(),
                args: vec![],
            },
            ActionRef {
                name: "set_two".to_string(),
                args: vec![],
            },
        ],
        default_action: Some(ActionRef {
            name: "set_zero".to_string(),
            args: vec![],
        }),
    }));
    let program = control_program(
        vec![Parameter::new("x", Direction::Out, Type::bits(8))],
        vec![
            action("set_one", 1),
            action("set_two", 2),
            action("set_zero", 0),
            table,
        ],
        vec![Statement::MethodCall(Expr::call(
            Expr::member(Expr::path("t"), "apply"),
            vec![],
        ))],
        vec![],
    );
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["ig"], "x").as_bv().unwrap();

    let hit = Bool::new_const(&ctx, "t_hit");
    let action_var = BV::new_const(&ctx, "t_action", 32);

    // hit and selector 0 force the first action's effect
    let first = Bool::and(&ctx, &[&hit, &action_var._eq(&BV::from_u64(&ctx, 0, 32))]);
    assert_valid(&ctx, &first.implies(&x._eq(&BV::from_u64(&ctx, 1, 8))));
    // a miss runs the default action
    assert_valid(
        &ctx,
        &hit.not().implies(&x._eq(&BV::from_u64(&ctx, 0, 8))),
    );
}

#[test]
fn parser_select_forks_and_merges() {
    // select(s) { 0 -> st_a (x=1); default -> st_b (x=2) }
    let ctx = Context::new(&Config::new());
    let assign = |value: u64| Statement::Assign {
        target: Expr::path("x"),
        value: Expr::uint(value, 8),
    };
    let parser = Declaration::Parser(Arc::new(ParserDecl {
        name: "MyP".to_string(),
        type_params: vec![],
        params: vec![
            Parameter::new("s", Direction::In, Type::bits(8)),
            Parameter::new("x", Direction::Out, Type::bits(8)),
        ],
        constructor_params: vec![],
        locals: vec![],
        states: vec![
            ParserState {
                name: "start".to_string(),
                body: vec![],
                transition: Transition::Select {
                    selectors: vec![Expr::path("s")],
                    cases: vec![
                        SelectCase {
                            keyset: vec![KeySetExpr::Expr(Expr::uint(0, 8))],
                            next: "st_a".to_string(),
                        },
                        SelectCase {
                            keyset: vec![KeySetExpr::Default],
                            next: "st_b".to_string(),
                        },
                    ],
                },
            },
            ParserState {
                name: "st_a".to_string(),
                body: vec![assign(1)],
                transition: Transition::Direct("accept".to_string()),
            },
            ParserState {
                name: "st_b".to_string(),
                body: vec![assign(2)],
                transition: Transition::Direct("accept".to_string()),
            },
        ],
    }));
    let program = Program {
        declarations: vec![
            parser,
            Declaration::ParserType(Arc::new(PipelineType {
                name: "PProto".to_string(),
                type_params: vec![],
                params: vec![
                    Parameter::new("s", Direction::In, Type::bits(8)),
                    Parameter::new("x", Direction::Out, Type::bits(8)),
                ],
            })),
            Declaration::Package(Arc::new(PackageType {
                name: "Pkg".to_string(),
                type_params: vec![],
                params: vec![Parameter::new(
                    "p",
                    Direction::None,
                    Type::Name("PProto".to_string()),
                )],
            })),
            Declaration::Instance(Arc::new(InstanceDecl {
                name: "main".to_string(),
                ty: Type::Name("Pkg".to_string()),
                args: vec![Argument::positional(Expr::construct(
                    Type::Name("MyP".to_string()),
                    vec![],
                ))],
            })),
        ],
    };
    let pipelines = run_program(&ctx, &program).unwrap();
    let x = find_leaf(&pipelines["p"], "x").as_bv().unwrap();

    let s = BV::new_const(&ctx, "s0", 8);
    let expected = s
        ._eq(&BV::from_u64(&ctx, 0, 8))
        .ite(&BV::from_u64(&ctx, 1, 8), &BV::from_u64(&ctx, 2, 8));
    assert_valid(&ctx, &x._eq(&expected));
}

#[test]
fn extract_validates_the_filled_header() {
    // pkt.extract(h); h.a = 0x55  =>  the assignment survives gating
    let ctx = Context::new(&Config::new());
    let packet_in = Declaration::Extern(Arc::new(p4v_ir::ExternType {
        name: "packet_in".to_string(),
        type_params: vec![],
        methods: vec![p4v_ir::MethodSig {
            name: "extract".to_string(),
            return_type: Type::Void,
            type_params: vec!["T".to_string()],
            params: vec![Parameter::new(
                "hdr",
                Direction::Out,
                Type::Name("T".to_string()),
            )],
        }],
    }));
    let parser = Declaration::Parser(Arc::new(ParserDecl {
        name: "MyP".to_string(),
        type_params: vec![],
        params: vec![
            Parameter::new("pkt", Direction::None, Type::Name("packet_in".to_string())),
            Parameter::new("h", Direction::Out, Type::Name("H".to_string())),
        ],
        constructor_params: vec![],
        locals: vec![],
        states: vec![ParserState {
            name: "start".to_string(),
            body: vec![
                Statement::MethodCall(Expr::call(
                    Expr::member(Expr::path("pkt"), "extract"),
                    vec![Argument::positional(Expr::path("h"))],
                )),
                Statement::Assign {
                    target: Expr::member(Expr::path("h"), "a"),
                    value: Expr::uint(0x55, 8),
                },
            ],
            transition: Transition::Direct("accept".to_string()),
        }],
    }));
    let program = Program {
        declarations: vec![
            header_h(),
            packet_in,
            parser,
            Declaration::ParserType(Arc::new(PipelineType {
                name: "PProto".to_string(),
                type_params: vec![],
                params: vec![
                    Parameter::new("pkt", Direction::None, Type::Name("packet_in".to_string())),
                    Parameter::new("h", Direction::Out, Type::Name("H".to_string())),
                ],
            })),
            Declaration::Package(Arc::new(PackageType {
                name: "Pkg".to_string(),
                type_params: vec![],
                params: vec![Parameter::new(
                    "p",
                    Direction::None,
                    Type::Name("PProto".to_string()),
                )],
            })),
            Declaration::Instance(Arc::new(InstanceDecl {
                name: "main".to_string(),
                ty: Type::Name("Pkg".to_string()),
                args: vec![Argument::positional(Expr::construct(
                    Type::Name("MyP".to_string()),
                    vec![],
                ))],
            })),
        ],
    };
    let pipelines = run_program(&ctx, &program).unwrap();
    let leaf = find_leaf(&pipelines["p"], "h.a").as_bv().unwrap();
    assert_valid(&ctx, &leaf._eq(&BV::from_u64(&ctx, 0x55, 8)));
}

#[test]
fn identical_programs_interpret_identically() {
    // Determinism: two runs over the same program produce equivalent leaves.
    let ctx = Context::new(&Config::new());
    let build = || {
        control_program(
            vec![
                Parameter::new("c", Direction::In, Type::Bool),
                Parameter::new("x", Direction::Out, Type::bits(8)),
            ],
            vec![],
            vec![Statement::If {
                condition: Expr::path("c"),
                then_branch: Box::new(Statement::Assign {
                    target: Expr::path("x"),
                    value: Expr::uint(1, 8),
                }),
                else_branch: Some(Box::new(Statement::Assign {
                    target: Expr::path("x"),
                    value: Expr::uint(2, 8),
                })),
            }],
            vec![],
        )
    };
    let first = run_program(&ctx, &build()).unwrap();
    let second = run_program(&ctx, &build()).unwrap();

    let a = &first["ig"];
    let b = &second["ig"];
    assert_eq!(a.len(), b.len());
    for ((name_a, expr_a), (name_b, expr_b)) in a.iter().zip(b.iter()) {
        assert_eq!(name_a, name_b);
        let eq_a = expr_a.as_bv().unwrap();
        let eq_b = expr_b.as_bv().unwrap();
        assert_valid(&ctx, &eq_a._eq(&eq_b));
    }
}
