//! Protobuf-c serialization unit.
//!
//! Emits the result-visitor callbacks (`proto_add_int`, `proto_add_set`,
//! `proto_add_multiset`, `proto_add_hll`) and the output drivers. One
//! result message is materialized per groupby tuple and written to stdout
//! as a `(u64 length, bytes payload)` record. The length prefix is
//! native-endian, as it has always been; cross-architecture consumers must
//! account for it.

use super::{c_quote, Writer};
use crate::config::ProtoDescriptor;
use crate::error::CompileError;
use crate::program::Program;
use crate::proto_schema::{validate_fields, ProtoSchema};

/// Validate result variables against the schema, then emit the unit.
pub fn generate_proto(
    program: &Program,
    descriptor: &ProtoDescriptor,
    schema: &ProtoSchema,
    includes: &[String],
) -> Result<String, CompileError> {
    validate_fields(program, schema, &descriptor.message)?;

    let mut w = Writer::new();
    emit_prologue(&mut w, descriptor, includes);
    emit_add_int(&mut w, program, descriptor);
    emit_add_set(&mut w, program, descriptor);
    emit_add_multiset(&mut w, program, descriptor);
    emit_add_hll(&mut w, program, descriptor);
    emit_output_groupby_result(&mut w, program, descriptor);
    emit_output(&mut w);
    Ok(w.finish())
}

fn emit_prologue(w: &mut Writer, descriptor: &ProtoDescriptor, includes: &[String]) {
    w.o("#include <stdint.h>");
    w.o("#include <stdbool.h>");
    w.o("#include <string.h>");
    w.o("#include <stdio.h>");
    w.o("#include <stdlib.h>");
    w.o("#include <Judy.h>");
    w.o("#include <traildb.h>");
    w.o("#include \"fns_generated.h\"");
    w.o("#include \"foreach_util.h\"");
    w.o("#include \"utils.h\"");
    w.o("#include \"safeio.h\"");
    w.o("#include \"hyperloglog.h\"");
    w.o("#include \"results_protobuf.h\"");
    w.o(format!("#include \"{}\"", descriptor.pb_header()));
    for include in includes {
        w.o(format!("#include \"{}\"", include));
    }
    w.blank();
    w.o("#if DEBUG");
    w.o("#define DBG_PRINTF(msg, ...) fprintf(stderr, msg, ##__VA_ARGS__);");
    w.o("#else");
    w.o("#define DBG_PRINTF(msg, ...)");
    w.o("#endif");
    w.o("#define MAXLINELEN 1000000");
    w.blank();
    for tuple in ["SetTuple", "MultisetTuple", "Hll"] {
        w.o(format!(
            "const static {} {} = {};",
            descriptor.message_struct(tuple),
            descriptor.tuple_default_const(tuple),
            descriptor.message_init(tuple)
        ));
    }
    w.blank();
    w.o("const int protobuf_enabled = 1;");
    w.blank();
}

fn emit_add_int(w: &mut Writer, program: &Program, descriptor: &ProtoDescriptor) {
    let msg = descriptor.result_struct();
    w.open("void proto_add_int(void *p, char *name, int64_t value)");
    w.o(format!("{} *msg = ({} *) p;", msg, msg));
    for counter in &program.yield_counters {
        let field = format!("counter_{}", &counter[1..]);
        w.open(format!("if (!strcmp(name, \"{}\"))", c_quote(counter)));
        w.o(format!("msg->{} = value;", field));
        w.close();
    }
    w.close();
    w.blank();
}

/// Shared body of the set/multiset visitors: walk the Judy string array,
/// decode each packed tuple and copy its items into the message.
fn emit_tuple_copy_loop(
    w: &mut Writer,
    descriptor: &ProtoDescriptor,
    field: &str,
    tuple_type: &str,
    counted: bool,
) {
    w.o(format!("msg->n_{} = JSL_size(value);", field));
    w.o(format!(
        "msg->{} = malloc(msg->n_{} * sizeof(void *));",
        field, field
    ));
    w.o("int i = 0;");
    w.o("uint8_t index[MAXLINELEN];");
    w.o("index[0] = '\\0';");
    w.o("Word_t *pv;");
    w.o("JSLF(pv, *value, index);");
    w.open("while (pv)");
    w.o("char buf[1024];");
    w.o("char *tail = (char*) index;");
    w.o("int res_len;");
    w.o("int res_type;");
    w.o(format!(
        "msg->{}[i] = malloc(sizeof({}));",
        field,
        descriptor.message_struct(tuple_type)
    ));
    w.o(format!(
        "*(msg->{}[i]) = {};",
        field,
        descriptor.tuple_default_const(tuple_type)
    ));
    w.o("int size = string_tuple_size(tail);");
    w.o(format!(
        "msg->{}[i]->values = malloc(size * sizeof(char *));",
        field
    ));
    w.o(format!("msg->{}[i]->n_values = size;", field));
    if counted {
        w.o(format!("msg->{}[i]->count = *pv;", field));
    }
    w.o("int j = 0;");
    w.open("while (!string_tuple_is_empty(tail))");
    w.o("tail = string_tuple_extract_head(tail, sizeof(buf), (uint8_t *)buf, &res_len, &res_type);");
    w.o("buf[res_len] = '\\0';");
    w.o(format!(
        "msg->{}[i]->values[j] = malloc(sizeof(char) * (res_len + 1));",
        field
    ));
    w.o(format!(
        "strncpy(msg->{}[i]->values[j], buf, res_len + 1);",
        field
    ));
    w.o("j++;");
    w.close();
    w.o("i++;");
    w.o("JSLN(pv, *value, index);");
    w.close();
}

fn emit_add_set(w: &mut Writer, program: &Program, descriptor: &ProtoDescriptor) {
    let msg = descriptor.result_struct();
    w.open("void proto_add_set(void *p, char *name, set_t *value)");
    w.o(format!("{} *msg = ({} *) p;", msg, msg));
    for set in &program.yield_sets {
        w.open(format!("if (!strcmp(name, \"#{}\"))", c_quote(set)));
        emit_tuple_copy_loop(w, descriptor, &format!("set_{}", set), "SetTuple", false);
        w.close();
    }
    w.close();
    w.blank();
}

fn emit_add_multiset(w: &mut Writer, program: &Program, descriptor: &ProtoDescriptor) {
    let msg = descriptor.result_struct();
    w.open("void proto_add_multiset(void *p, char *name, set_t *value)");
    w.o(format!("{} *msg = ({} *) p;", msg, msg));
    for mset in &program.yield_multisets {
        w.open(format!("if (!strcmp(name, \"&{}\"))", c_quote(mset)));
        emit_tuple_copy_loop(
            w,
            descriptor,
            &format!("multiset_{}", mset),
            "MultisetTuple",
            true,
        );
        w.close();
    }
    w.close();
    w.blank();
}

fn emit_add_hll(w: &mut Writer, program: &Program, descriptor: &ProtoDescriptor) {
    let msg = descriptor.result_struct();
    w.open("void proto_add_hll(void *p, char *name, hyperloglog_t *value)");
    w.o(format!("{} *msg = ({} *) p;", msg, msg));
    for hll in &program.yield_hlls {
        let field = format!("hll_{}", hll);
        w.open(format!("if (!strcmp(name, \"^{}\"))", c_quote(hll)));
        w.o(format!(
            "msg->{} = malloc(sizeof({}));",
            field,
            descriptor.message_struct("Hll")
        ));
        w.o(format!(
            "*msg->{} = {};",
            field,
            descriptor.tuple_default_const("Hll")
        ));
        w.open("if (value)");
        w.o(format!("msg->{}->precision = value->p;", field));
        w.o(format!("msg->{}->empty = 0;", field));
        w.o("const char *encodedHll = hll_to_string(value);");
        w.o(format!(
            "msg->{}->bins.data = (uint8_t*) encodedHll + 4;",
            field
        ));
        w.o(format!(
            "msg->{}->bins.len = strlen(encodedHll) - 4;",
            field
        ));
        w.close();
        w.open("else");
        w.o(format!("msg->{}->precision = 14;", field));
        w.o(format!("msg->{}->empty = 1;", field));
        w.o(format!("msg->{}->bins.data = 0;", field));
        w.o(format!("msg->{}->bins.len = 0;", field));
        w.close();
        w.close();
    }
    w.close();
    w.blank();
}

fn emit_output_groupby_result(w: &mut Writer, program: &Program, descriptor: &ProtoDescriptor) {
    w.open("void output_groupby_result_proto(groupby_info_t *gi, int i, results_t *results)");
    w.o(format!(
        "{} msg = {};",
        descriptor.result_struct(),
        descriptor.result_init()
    ));
    w.o("string_val_t *tuple = &gi->tuples[i * gi->num_vars];");
    w.o("results_t *pres = (results_t *)((uint8_t *)results + match_get_result_size() * i);");
    for (index, var) in program.groupby_vars.iter().enumerate() {
        let field = format!("scalar_{}", &var[1..]);
        w.o(format!(
            "msg.{} = malloc(sizeof(char) * (tuple[{}].len + 1));",
            field, index
        ));
        w.o(format!(
            "strncpy(msg.{}, tuple[{}].str, tuple[{}].len);",
            field, index, index
        ));
        w.o(format!("msg.{}[tuple[{}].len] = '\\0';", field, index));
    }
    w.o("match_save_result(pres, &msg, proto_add_int, proto_add_set, proto_add_multiset, proto_add_hll);");
    w.o(format!(
        "unsigned long len = {}(&msg);",
        descriptor.get_packed_size_fn()
    ));
    w.o("void *buf = malloc(len);");
    w.o(format!("{}(&msg, buf);", descriptor.pack_fn()));
    // Native-endian length prefix; see the module doc.
    w.o("fwrite(&len, sizeof(unsigned long), 1, stdout);");
    w.o("fwrite(buf, len, 1, stdout);");
    w.o("free(buf);");
    w.close();
    w.blank();
}

fn emit_output(w: &mut Writer) {
    w.open("void output_proto(groupby_info_t *gi, results_t *results)");
    w.open("for (int i = 0; i < gi->num_tuples; i++)");
    w.o("output_groupby_result_proto(gi, i, results);");
    w.close();
    w.close();
}
