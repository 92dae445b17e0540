//! Fixed C# support classes shipped next to the generated units.

/// `Mem.cs` body: linear memory, the trap exception and saturating conversions.
pub const MEM: &str = r#"sealed class TrapException : Exception
{
    public TrapException(string message)
        : base(message)
    {
    }
}

sealed class Mem
{
    public const int PageSize = 65536;

    public Mem(int minPages, int? maxPages)
    {
        bytes_ = new byte[(long)minPages * PageSize];
        maxPages_ = maxPages ?? 65536;
    }

    public int Size => bytes_.Length / PageSize;

    public int Grow(int delta)
    {
        int old = Size;
        long next = (long)old + (uint)delta;
        if (next > maxPages_ || next * PageSize > int.MaxValue)
        {
            return -1;
        }
        Array.Resize(ref bytes_, (int)(next * PageSize));
        return old;
    }

    public void Write(int addr, byte[] data)
    {
        Buffer.BlockCopy(data, 0, bytes_, Index(addr, 0, (uint)data.Length), data.Length);
    }

    public void Copy(int dst, int src, int len)
    {
        int to = Index(dst, 0, (uint)len);
        int from = Index(src, 0, (uint)len);
        Buffer.BlockCopy(bytes_, from, bytes_, to, len);
    }

    public void Fill(int dst, int value, int len)
    {
        Array.Fill(bytes_, (byte)value, Index(dst, 0, (uint)len), len);
    }

    public sbyte LoadInt8(int addr, uint offset = 0) => (sbyte)bytes_[Index(addr, offset, 1)];
    public byte LoadUint8(int addr, uint offset = 0) => bytes_[Index(addr, offset, 1)];
    public short LoadInt16(int addr, uint offset = 0) => BinaryPrimitives.ReadInt16LittleEndian(Bytes(addr, offset, 2));
    public ushort LoadUint16(int addr, uint offset = 0) => BinaryPrimitives.ReadUInt16LittleEndian(Bytes(addr, offset, 2));
    public int LoadInt32(int addr, uint offset = 0) => BinaryPrimitives.ReadInt32LittleEndian(Bytes(addr, offset, 4));
    public uint LoadUint32(int addr, uint offset = 0) => BinaryPrimitives.ReadUInt32LittleEndian(Bytes(addr, offset, 4));
    public long LoadInt64(int addr, uint offset = 0) => BinaryPrimitives.ReadInt64LittleEndian(Bytes(addr, offset, 8));
    public float LoadFloat32(int addr, uint offset = 0) => BitConverter.Int32BitsToSingle(LoadInt32(addr, offset));
    public double LoadFloat64(int addr, uint offset = 0) => BitConverter.Int64BitsToDouble(LoadInt64(addr, offset));

    public void StoreInt8(int addr, sbyte value) => StoreInt8(addr, 0, value);
    public void StoreInt8(int addr, uint offset, sbyte value) => bytes_[Index(addr, offset, 1)] = (byte)value;
    public void StoreInt16(int addr, short value) => StoreInt16(addr, 0, value);
    public void StoreInt16(int addr, uint offset, short value) => BinaryPrimitives.WriteInt16LittleEndian(Bytes(addr, offset, 2), value);
    public void StoreInt32(int addr, int value) => StoreInt32(addr, 0, value);
    public void StoreInt32(int addr, uint offset, int value) => BinaryPrimitives.WriteInt32LittleEndian(Bytes(addr, offset, 4), value);
    public void StoreInt64(int addr, long value) => StoreInt64(addr, 0, value);
    public void StoreInt64(int addr, uint offset, long value) => BinaryPrimitives.WriteInt64LittleEndian(Bytes(addr, offset, 8), value);
    public void StoreFloat32(int addr, float value) => StoreFloat32(addr, 0, value);
    public void StoreFloat32(int addr, uint offset, float value) => StoreInt32(addr, offset, BitConverter.SingleToInt32Bits(value));
    public void StoreFloat64(int addr, double value) => StoreFloat64(addr, 0, value);
    public void StoreFloat64(int addr, uint offset, double value) => StoreInt64(addr, offset, BitConverter.DoubleToInt64Bits(value));

    // Go slices are (pointer, length, capacity) and strings (pointer, length),
    // each field 8 bytes wide.
    public ArraySegment<byte> LoadSlice(int addr)
    {
        return LoadSliceDirectly(LoadInt64(addr), (int)LoadInt64(addr + 8));
    }

    public ArraySegment<byte> LoadSliceDirectly(long array, int len)
    {
        return new ArraySegment<byte>(bytes_, Index((int)array, 0, (uint)len), len);
    }

    public string LoadString(int addr)
    {
        var bytes = LoadSliceDirectly(LoadInt64(addr), (int)LoadInt64(addr + 8));
        return Encoding.UTF8.GetString(bytes.Array, bytes.Offset, bytes.Count);
    }

    private Span<byte> Bytes(int addr, uint offset, int width)
    {
        return bytes_.AsSpan(Index(addr, offset, (uint)width), width);
    }

    private int Index(int addr, uint offset, uint width)
    {
        ulong start = (ulong)(uint)addr + offset;
        if (start + width > (ulong)bytes_.Length)
        {
            throw new TrapException("out of bounds memory access");
        }
        return (int)start;
    }

    private byte[] bytes_;
    private readonly long maxPages_;
}

static class Numerics
{
    public static int TruncSatInt32(double value)
    {
        if (double.IsNaN(value))
        {
            return 0;
        }
        if (value <= int.MinValue)
        {
            return int.MinValue;
        }
        if (value >= int.MaxValue)
        {
            return int.MaxValue;
        }
        return (int)value;
    }

    public static int TruncSatUint32(double value)
    {
        if (double.IsNaN(value) || value <= 0)
        {
            return 0;
        }
        if (value >= uint.MaxValue)
        {
            return unchecked((int)uint.MaxValue);
        }
        return (int)(uint)value;
    }

    public static long TruncSatInt64(double value)
    {
        if (double.IsNaN(value))
        {
            return 0;
        }
        if (value <= long.MinValue)
        {
            return long.MinValue;
        }
        if (value >= long.MaxValue)
        {
            return long.MaxValue;
        }
        return (long)value;
    }

    public static long TruncSatUint64(double value)
    {
        if (double.IsNaN(value) || value <= 0)
        {
            return 0;
        }
        if (value >= ulong.MaxValue)
        {
            return -1;
        }
        return (long)(ulong)value;
    }
}
"#;

/// Host services the shims call into; implemented by the embedding program.
pub const HOST: &str = r#"interface IHost
{
    object Global { get; }
    object Undefined { get; }
    void Exit(int code);
    void DebugWrite(ArraySegment<byte> bytes);
    long PreciseNowInNanoseconds();
    double UnixNowInMilliseconds();
    int SetTimeout(double interval);
    void ClearTimeout(int id);
    byte[] GetRandomBytes(int length);
    object ReflectGet(object target, string key);
    void ReflectSet(object target, string key, object value);
    void ReflectDelete(object target, string key);
    object ReflectApply(object target, object self, object[] args);
    object ReflectConstruct(object target, object[] args);
}

// Go's syscall/js refs: a non-zero float is stored inline, anything else as
// a NaN whose high word carries a type flag and whose low word is a table id.
sealed class ValueTable
{
    private const uint NanHead = 0x7FF80000;

    public ValueTable(IHost host)
    {
        host_ = host;
        values_ = new List<object> { double.NaN, 0.0, null, true, false, host.Global, host };
        refCounts_ = new List<double>();
        for (int i = 0; i < values_.Count; i++)
        {
            refCounts_.Add(double.PositiveInfinity);
        }
        ids_ = new Dictionary<object, int>
        {
            { 0.0, 1 },
            { true, 3 },
            { false, 4 },
            { host.Global, 5 },
            { host, 6 },
        };
        idPool_ = new Stack<int>();
    }

    public object Load(Mem mem, int addr)
    {
        double f = mem.LoadFloat64(addr);
        if (f == 0)
        {
            return host_.Undefined;
        }
        if (!double.IsNaN(f))
        {
            return f;
        }
        return values_[(int)mem.LoadUint32(addr)];
    }

    public object[] LoadSlice(Mem mem, int addr)
    {
        long array = mem.LoadInt64(addr);
        long len = mem.LoadInt64(addr + 8);
        var result = new object[len];
        for (int i = 0; i < len; i++)
        {
            result[i] = Load(mem, (int)(array + i * 8));
        }
        return result;
    }

    public void Store(Mem mem, int addr, object value)
    {
        if (value is double d && d != 0)
        {
            if (double.IsNaN(d))
            {
                mem.StoreInt32(addr + 4, unchecked((int)NanHead));
                mem.StoreInt32(addr, 0);
                return;
            }
            mem.StoreFloat64(addr, d);
            return;
        }
        if (value == host_.Undefined)
        {
            mem.StoreFloat64(addr, 0);
            return;
        }

        int id;
        if (value == null)
        {
            id = 2;
        }
        else if (!ids_.TryGetValue(value, out id))
        {
            if (idPool_.Count > 0)
            {
                id = idPool_.Pop();
                values_[id] = value;
                refCounts_[id] = 0;
            }
            else
            {
                id = values_.Count;
                values_.Add(value);
                refCounts_.Add(0);
            }
            ids_[value] = id;
        }
        refCounts_[id]++;

        uint typeFlag = value switch
        {
            null => 0,
            string _ => 2,
            Delegate _ => 4,
            bool _ => 0,
            double _ => 0,
            _ => 1,
        };
        mem.StoreInt32(addr + 4, unchecked((int)(NanHead | typeFlag)));
        mem.StoreInt32(addr, id);
    }

    public void Release(int id)
    {
        refCounts_[id]--;
        if (refCounts_[id] == 0)
        {
            var value = values_[id];
            values_[id] = null;
            ids_.Remove(value);
            idPool_.Push(id);
        }
    }

    private readonly IHost host_;
    private readonly List<object> values_;
    private readonly List<double> refCounts_;
    private readonly Dictionary<object, int> ids_;
    private readonly Stack<int> idPool_;
}
"#;
